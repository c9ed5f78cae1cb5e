//! Deterministic fake collaborators for the §8 end-to-end scenarios.
//! Exercised by this crate's own tests and reused by `vmw2scw_pipeline`
//! and `vmw2scw_orchestrator`'s test suites, which need real budgets and
//! a real state store but fake everything past the network boundary.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use vmw2scw_types::VmRecord;

use crate::ports::{CollabResult, ExportLease, InventorySource, ObjectStore, ProgressSink, RemoteState, SourceSession, TargetClient};

#[derive(Default)]
pub struct FakeInventory {
    vms: Mutex<HashMap<String, VmRecord>>,
}

impl FakeInventory {
    pub fn new(vms: Vec<VmRecord>) -> Self {
        Self { vms: Mutex::new(vms.into_iter().map(|v| (v.name.clone(), v)).collect()) }
    }
}

#[async_trait::async_trait]
impl InventorySource for FakeInventory {
    async fn list_vms(&self) -> CollabResult<Vec<VmRecord>> {
        Ok(self.vms.lock().unwrap().values().cloned().collect())
    }

    async fn get_vm(&self, vm_name: &str) -> CollabResult<VmRecord> {
        self.vms
            .lock()
            .unwrap()
            .get(vm_name)
            .cloned()
            .ok_or_else(|| crate::ports::CollabError::NotFound(vm_name.to_string()))
    }
}

pub struct FakeLease;
#[async_trait::async_trait]
impl ExportLease for FakeLease {
    async fn keepalive(&self, _percent_complete: f64) -> CollabResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSourceSession {
    pub snapshots: Mutex<Vec<(String, String)>>,
    pub disk_bytes: u64,
    pub fail_quiesce: bool,
}

impl FakeSourceSession {
    pub fn new(disk_bytes: u64) -> Self {
        Self { snapshots: Mutex::new(Vec::new()), disk_bytes, fail_quiesce: false }
    }
}

#[async_trait::async_trait]
impl SourceSession for FakeSourceSession {
    async fn create_snapshot(&self, vm_name: &str, snapshot_name: &str, quiesce: bool) -> CollabResult<()> {
        if quiesce && self.fail_quiesce {
            return Err(crate::ports::CollabError::Transient("quiesce unsupported".into()));
        }
        self.snapshots.lock().unwrap().push((vm_name.to_string(), snapshot_name.to_string()));
        Ok(())
    }

    async fn delete_snapshot(&self, vm_name: &str, snapshot_name: &str) -> CollabResult<()> {
        self.snapshots.lock().unwrap().retain(|(v, s)| !(v == vm_name && s == snapshot_name));
        Ok(())
    }

    async fn download_disk(
        &self,
        _vm_name: &str,
        _disk_index: usize,
        dest_path: &Path,
        lease: &dyn ExportLease,
    ) -> CollabResult<u64> {
        lease.keepalive(50.0).await?;
        tokio::fs::write(dest_path, vec![0u8; self.disk_bytes as usize]).await?;
        lease.keepalive(100.0).await?;
        Ok(self.disk_bytes)
    }
}

#[derive(Default)]
pub struct FakeTargetClient {
    pub known_types: Vec<String>,
    snapshots: Mutex<HashMap<String, RemoteState>>,
}

impl FakeTargetClient {
    pub fn new(known_types: Vec<String>) -> Self {
        Self { known_types, snapshots: Mutex::new(HashMap::new()) }
    }
}

#[async_trait::async_trait]
impl TargetClient for FakeTargetClient {
    async fn instance_type_exists(&self, type_name: &str) -> CollabResult<bool> {
        Ok(self.known_types.iter().any(|t| t == type_name))
    }

    async fn import_snapshot(&self, _bucket: &str, object_key: &str) -> CollabResult<String> {
        let id = format!("snap-{object_key}");
        self.snapshots.lock().unwrap().insert(id.clone(), RemoteState::Available);
        Ok(id)
    }

    async fn snapshot_state(&self, snapshot_id: &str) -> CollabResult<RemoteState> {
        Ok(self.snapshots.lock().unwrap().get(snapshot_id).copied().unwrap_or(RemoteState::Error))
    }

    async fn create_image(&self, boot_snapshot_id: &str, _extra_snapshot_ids: &[String]) -> CollabResult<String> {
        Ok(format!("img-{boot_snapshot_id}"))
    }
}

#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<HashMap<String, u64>>,
}

#[async_trait::async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, bucket: &str, key: &str, path: &Path) -> CollabResult<()> {
        let meta = tokio::fs::metadata(path).await?;
        self.objects.lock().unwrap().insert(format!("{bucket}/{key}"), meta.len());
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> CollabResult<Option<u64>> {
        Ok(self.objects.lock().unwrap().get(&format!("{bucket}/{key}")).copied())
    }

    async fn delete(&self, bucket: &str, key: &str) -> CollabResult<()> {
        self.objects.lock().unwrap().remove(&format!("{bucket}/{key}"));
        Ok(())
    }
}

/// Records every event it receives, for assertion in end-to-end tests.
#[derive(Default)]
pub struct RecordingProgressSink {
    pub events: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingProgressSink {
    fn on_batch_start(&self, batch_id: &str, total_vms: usize) {
        self.events.lock().unwrap().push(format!("batch_start:{batch_id}:{total_vms}"));
    }
    fn on_wave_start(&self, wave_index: u32, vm_count: usize) {
        self.events.lock().unwrap().push(format!("wave_start:{wave_index}:{vm_count}"));
    }
    fn on_wave_complete(&self, wave_index: u32, succeeded: usize, failed: usize) {
        self.events.lock().unwrap().push(format!("wave_complete:{wave_index}:{succeeded}:{failed}"));
    }
    fn on_wave_pause(&self, wave_index: u32) {
        self.events.lock().unwrap().push(format!("wave_pause:{wave_index}"));
    }
    fn on_vm_stage_start(&self, migration_id: &str, stage: &str) {
        self.events.lock().unwrap().push(format!("stage_start:{migration_id}:{stage}"));
    }
    fn on_vm_stage_complete(&self, migration_id: &str, stage: &str, duration_secs: f64) {
        self.events.lock().unwrap().push(format!("stage_complete:{migration_id}:{stage}:{duration_secs:.3}"));
    }
    fn on_vm_complete(&self, migration_id: &str) {
        self.events.lock().unwrap().push(format!("vm_complete:{migration_id}"));
    }
    fn on_vm_failed(&self, migration_id: &str, stage: &str, error: &str) {
        self.events.lock().unwrap().push(format!("vm_failed:{migration_id}:{stage}:{error}"));
    }
    fn on_batch_complete(&self, batch_id: &str, status: &str) {
        self.events.lock().unwrap().push(format!("batch_complete:{batch_id}:{status}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_inventory_roundtrips_vm() {
        let vm = VmRecord {
            name: "web-01".into(),
            moref: "vm-1".into(),
            power_state: vmw2scw_types::PowerState::PoweredOn,
            cpu: 2,
            memory_mb: 2048,
            guest_os_id: "ubuntu64Guest".into(),
            guest_os_full: "".into(),
            firmware: vmw2scw_types::Firmware::Bios,
            disks: vec![],
            nics: vec![],
            host: "esxi-1".into(),
            cluster: "c".into(),
            datacenter: "dc".into(),
            folder: "/dc/vm".into(),
            tags: vec![],
            tools_status: "toolsOk".into(),
            uuid: "u".into(),
            snapshots: vec![],
        };
        let inv = FakeInventory::new(vec![vm]);
        assert!(inv.get_vm("web-01").await.is_ok());
        assert!(inv.get_vm("missing").await.is_err());
    }

    #[tokio::test]
    async fn fake_object_store_head_reflects_put() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.qcow2");
        tokio::fs::write(&file, b"hello").await.unwrap();
        let store = FakeObjectStore::default();
        store.put("bucket", "key", &file).await.unwrap();
        assert_eq!(store.head("bucket", "key").await.unwrap(), Some(5));
    }
}
