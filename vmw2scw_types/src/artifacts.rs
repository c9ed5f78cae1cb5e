//! The per-VM artifact bag (§3 VMJob.artifacts, §9 "Artifact bag vs typed
//! struct").
//!
//! The original implementation threads stage outputs through an untyped
//! `dict[str, Any]`. This port keeps the resumability property that design
//! affords (any subset of fields may be populated after a crash) but gives
//! each known key a name and a type, matching the teacher's general
//! preference for explicit structs over stringly-typed maps.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::vm_record::VmRecord;

/// Stage outputs accumulated as a VM's pipeline progresses.
///
/// Every field is optional: a stage must read only the fields its declared
/// dependencies (§9 "Inter-stage data dependencies") guarantee are present,
/// and resume must tolerate a partially populated bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactBag {
    /// Snapshot of the source [`VmRecord`], copied in by `validate`.
    pub vm_info: Option<VmRecord>,
    /// Name of the quiescent snapshot created by `snapshot`.
    pub snapshot_name: Option<String>,
    /// Source-format (`.vmdk`) paths written by `export`, disk-index
    /// aligned with `vm_info.disks`.
    #[serde(default)]
    pub disk_paths: Vec<String>,
    /// Target-format (`.qcow2`) paths written by `convert`, index-aligned
    /// with `disk_paths`.
    #[serde(default)]
    pub image_paths: Vec<String>,
    /// Object-storage keys written by `upload`, disk-index aligned.
    #[serde(default)]
    pub object_keys: Vec<String>,
    pub object_bucket: Option<String>,
    /// Target-side snapshot ids created by `import`, boot disk first.
    #[serde(default)]
    pub target_snapshot_ids: Vec<String>,
    /// The final target image id. Non-empty iff the job is `complete`
    /// (§3 VMJob invariant).
    pub target_image_id: Option<String>,
    /// Catch-all for forward-compatible or adapter-private values that
    /// don't warrant a dedicated field (mirrors the original's dict, scoped
    /// down to the long tail).
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ArtifactBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(key.into(), value.into());
    }
}
