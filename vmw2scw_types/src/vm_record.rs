//! The VM record as read from the source inventory (§3 VMRecord).
//!
//! The core never mutates a [`VmRecord`]: it is constructed once from a
//! snapshot of the source inventory at plan time and is immutable for the
//! rest of the migration's lifetime.

use serde::{Deserialize, Serialize};

/// Power state of a source VM, as reported by the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Firmware type of a source VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Efi,
}

/// Storage controller a disk is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Controller {
    Scsi,
    Nvme,
    Ide,
}

/// One virtual disk attached to a source VM.
///
/// Disks are ordered; disk 0 is always the boot disk (§3 invariant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub size_gb: f64,
    pub thin: bool,
    pub datastore: String,
    pub file_path: String,
    pub controller: Controller,
    /// True for raw-device-mapping disks. `validate` treats these as a
    /// blocking precondition failure (§4.5).
    #[serde(default)]
    pub raw_device_mapping: bool,
}

/// A virtual network interface on a source VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicSpec {
    pub label: String,
    pub network: String,
    pub mac_address: String,
}

/// A source snapshot already present on the VM before migration (used by
/// `validate`'s "snapshot count <= 3" warning check).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub name: String,
    pub created_at: String,
}

/// A VM as inspected in the source inventory (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub moref: String,
    pub power_state: PowerState,
    pub cpu: u32,
    pub memory_mb: u64,
    pub guest_os_id: String,
    pub guest_os_full: String,
    pub firmware: Firmware,
    /// Ordered; `disks[0]` is the boot disk.
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    pub host: String,
    pub cluster: String,
    pub datacenter: String,
    /// Slash-path, e.g. `"/Datacenter/vm/Production"`.
    pub folder: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tools_status: String,
    pub uuid: String,
    #[serde(default)]
    pub snapshots: Vec<SnapshotRef>,
}

impl VmRecord {
    /// Total disk size across every disk, in GB.
    pub fn total_disk_gb(&self) -> f64 {
        self.disks.iter().map(|d| d.size_gb).sum()
    }

    /// The boot disk (§3/§GLOSSARY: disk index 0).
    pub fn boot_disk(&self) -> Option<&DiskSpec> {
        self.disks.first()
    }

    pub fn has_raw_device_mapping(&self) -> bool {
        self.disks.iter().any(|d| d.raw_device_mapping)
    }
}
