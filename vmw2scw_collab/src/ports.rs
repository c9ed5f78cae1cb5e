//! Trait ports for every external collaborator the core depends on but
//! does not implement the internals of (§6): the source inventory RPC,
//! a source management session, the target HTTP API, the object store,
//! and the progress/dashboard event sink.

use std::path::Path;

use vmw2scw_types::VmRecord;

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient failure after retries: {0}")]
    Transient(String),
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("timed out waiting for: {0}")]
    Timeout(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CollabResult<T> = Result<T, CollabError>;

/// Read-only access to the source inventory (§6 "source-inventory RPC
/// client"). The core reads a snapshot of VM records; it never mutates
/// inventory.
#[async_trait::async_trait]
pub trait InventorySource: Send + Sync {
    async fn list_vms(&self) -> CollabResult<Vec<VmRecord>>;
    async fn get_vm(&self, vm_name: &str) -> CollabResult<VmRecord>;
}

/// A handle to one export-in-flight disk stream, used to keep an export
/// lease alive with periodic keepalives (§4.5 `export`).
#[async_trait::async_trait]
pub trait ExportLease: Send + Sync {
    /// Send a keepalive / progress ping to the source. Called periodically
    /// while `download_disk` streams.
    async fn keepalive(&self, percent_complete: f64) -> CollabResult<()>;
}

/// Management-plane operations against the source hypervisor: snapshots
/// and disk export (§4.5 `snapshot`, `export`).
#[async_trait::async_trait]
pub trait SourceSession: Send + Sync {
    /// Create a quiesced snapshot; on quiesce-specific failure, callers
    /// should retry with `quiesce = false`.
    async fn create_snapshot(&self, vm_name: &str, snapshot_name: &str, quiesce: bool) -> CollabResult<()>;

    async fn delete_snapshot(&self, vm_name: &str, snapshot_name: &str) -> CollabResult<()>;

    /// Stream disk `disk_index` of `vm_name` to `dest_path`, invoking
    /// `keepalive` periodically with an overall percent-complete. Returns
    /// the number of bytes written.
    async fn download_disk(
        &self,
        vm_name: &str,
        disk_index: usize,
        dest_path: &Path,
        lease: &dyn ExportLease,
    ) -> CollabResult<u64>;
}

/// Poll-to-terminal status for a target-side async operation (snapshot
/// import, §4.5 `import`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Available,
    Error,
}

/// The target HTTP API: snapshot import from object storage and image
/// creation (§4.5 `import`).
#[async_trait::async_trait]
pub trait TargetClient: Send + Sync {
    /// Validate that `type_name` exists on the target.
    async fn instance_type_exists(&self, type_name: &str) -> CollabResult<bool>;

    /// Request ingestion of an uploaded object as a target-side snapshot;
    /// returns a snapshot id to poll with [`Self::snapshot_state`].
    async fn import_snapshot(&self, bucket: &str, object_key: &str) -> CollabResult<String>;

    async fn snapshot_state(&self, snapshot_id: &str) -> CollabResult<RemoteState>;

    /// Create an image whose root volume is `boot_snapshot_id` and whose
    /// extra volumes are `extra_snapshot_ids`, in order.
    async fn create_image(&self, boot_snapshot_id: &str, extra_snapshot_ids: &[String]) -> CollabResult<String>;
}

/// The S3-compatible object store (§6 "object-storage client").
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `path` to `bucket`/`key`. Idempotent at the call site: the
    /// `upload` stage checks [`Self::head`] first and skips the PUT if the
    /// key already exists with the same size.
    async fn put(&self, bucket: &str, key: &str, path: &Path) -> CollabResult<()>;

    /// Returns the object's size in bytes if it exists.
    async fn head(&self, bucket: &str, key: &str) -> CollabResult<Option<u64>>;

    async fn delete(&self, bucket: &str, key: &str) -> CollabResult<()>;
}

/// Non-blocking event sink consumed by the orchestrator (§4.8 "Progress
/// contract"). Implementations must be safe under concurrent calls from
/// different worker tasks — rendering is out of scope, only the event
/// contract is specified.
pub trait ProgressSink: Send + Sync {
    fn on_batch_start(&self, batch_id: &str, total_vms: usize) {
        let _ = (batch_id, total_vms);
    }
    fn on_wave_start(&self, wave_index: u32, vm_count: usize) {
        let _ = (wave_index, vm_count);
    }
    fn on_wave_complete(&self, wave_index: u32, succeeded: usize, failed: usize) {
        let _ = (wave_index, succeeded, failed);
    }
    fn on_wave_pause(&self, wave_index: u32) {
        let _ = wave_index;
    }
    fn on_vm_stage_start(&self, migration_id: &str, stage: &str) {
        let _ = (migration_id, stage);
    }
    fn on_vm_stage_complete(&self, migration_id: &str, stage: &str, duration_secs: f64) {
        let _ = (migration_id, stage, duration_secs);
    }
    fn on_vm_complete(&self, migration_id: &str) {
        let _ = migration_id;
    }
    fn on_vm_failed(&self, migration_id: &str, stage: &str, error: &str) {
        let _ = (migration_id, stage, error);
    }
    fn on_batch_complete(&self, batch_id: &str, status: &str) {
        let _ = (batch_id, status);
    }
}

/// A sink that discards every event. Useful as a default for callers that
/// don't care about progress (e.g. the single-VM `migrate` CLI command
/// piping to stdout logs instead).
pub struct NullProgressSink;
impl ProgressSink for NullProgressSink {}
