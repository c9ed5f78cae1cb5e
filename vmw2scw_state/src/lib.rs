// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Durable per-batch and per-VM state on the local work volume (§4.4
//! StateStore).
//!
//! Write policy: build the full document in memory, write it to a sibling
//! `.tmp` file, `fsync`, then rename over the target — so a reader never
//! observes a half-written document. Read policy: parse or report
//! corruption; never half-apply a document.
//!
//! The store itself does not coordinate concurrent writers: the
//! orchestrator serializes writes to a given batch file onto its single
//! checkpoint call (§4.4, §5 "Locking discipline").

use std::io::Write as _;
use std::path::{Path, PathBuf};

use vmw2scw_types::{BatchState, MigrationId, VmJob};

/// Errors produced while reading or writing state documents.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state document at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Root of the persistent work layout (§6 "Persistent work layout").
#[derive(Debug, Clone)]
pub struct StateStore {
    work_dir: PathBuf,
}

impl StateStore {
    /// Open a state store rooted at `work_dir`, creating the
    /// `batch-state/` and `state/` subdirectories if they don't exist yet.
    pub fn open(work_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let work_dir = work_dir.into();
        let store = Self { work_dir };
        fs_err::create_dir_all(store.batch_state_dir()).map_err(|e| StateError::Io {
            path: store.batch_state_dir(),
            source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("create_dir_all failed")),
        })?;
        fs_err::create_dir_all(store.per_vm_state_dir()).map_err(|e| StateError::Io {
            path: store.per_vm_state_dir(),
            source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("create_dir_all failed")),
        })?;
        Ok(store)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn batch_state_dir(&self) -> PathBuf {
        self.work_dir.join("batch-state")
    }

    pub fn per_vm_state_dir(&self) -> PathBuf {
        self.work_dir.join("state")
    }

    /// The transient per-migration scratch directory (deleted by
    /// `cleanup`, §6).
    pub fn migration_scratch_dir(&self, migration_id: &MigrationId) -> PathBuf {
        self.work_dir.join(migration_id.as_str())
    }

    fn batch_path(&self, batch_id: &vmw2scw_types::BatchId) -> PathBuf {
        self.batch_state_dir().join(format!("batch-{batch_id}.json"))
    }

    fn migration_path(&self, migration_id: &MigrationId) -> PathBuf {
        self.per_vm_state_dir().join(format!("{migration_id}.json"))
    }

    /// Checkpoint the full batch document: the single write path the
    /// orchestrator funnels every update through.
    pub fn save_batch(&self, state: &BatchState) -> Result<(), StateError> {
        write_atomic(&self.batch_path(&state.batch_id), state)
    }

    pub fn load_batch(&self, batch_id: &vmw2scw_types::BatchId) -> Result<Option<BatchState>, StateError> {
        read_json(&self.batch_path(batch_id))
    }

    pub fn list_batches(&self) -> Result<Vec<BatchState>, StateError> {
        let mut out = Vec::new();
        let dir = self.batch_state_dir();
        let entries = match fs_err::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                return Err(StateError::Io {
                    path: dir,
                    source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("read_dir failed")),
                })
            }
        };
        for entry in entries {
            let entry = entry.map_err(|e| StateError::Io {
                path: dir.clone(),
                source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("read_dir entry failed")),
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(state) = read_json::<BatchState>(&path)? {
                out.push(state);
            }
        }
        Ok(out)
    }

    /// Save the per-migration document used by the single-VM pipeline
    /// command (§4.4, §6).
    pub fn save_job(&self, job: &VmJob) -> Result<(), StateError> {
        write_atomic(&self.migration_path(&job.migration_id), job)
    }

    pub fn load_job(&self, migration_id: &MigrationId) -> Result<Option<VmJob>, StateError> {
        read_json(&self.migration_path(migration_id))
    }

    pub fn delete_job(&self, migration_id: &MigrationId) -> Result<(), StateError> {
        let path = self.migration_path(migration_id);
        if path.exists() {
            fs_err::remove_file(&path).map_err(|e| StateError::Io {
                path,
                source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("remove_file failed")),
            })?;
        }
        Ok(())
    }
}

fn write_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StateError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = fs_err::File::create(&tmp_path).map_err(|e| StateError::Io {
            path: tmp_path.clone(),
            source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("create failed")),
        })?;
        file.write_all(&bytes).map_err(|e| StateError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| StateError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
    }
    fs_err::rename(&tmp_path, path).map_err(|e| StateError::Io {
        path: path.to_path_buf(),
        source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("rename failed")),
    })?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs_err::read(path).map_err(|e| StateError::Io {
        path: path.to_path_buf(),
        source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("read failed")),
    })?;
    let value = serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmw2scw_types::{BatchId, Firmware, SizingStrategy};

    fn sample_job() -> VmJob {
        VmJob::new(
            "web-01",
            "PRO2-XXS",
            "fr-par-1",
            "esxi-1",
            Firmware::Bios,
            40.0,
            5,
            0,
            SizingStrategy::Optimize,
            false,
        )
    }

    #[test]
    fn batch_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let batch_id = BatchId::generate();
        let state = BatchState::new(batch_id.clone(), 1, vec![sample_job()]);
        store.save_batch(&state).unwrap();

        let loaded = store.load_batch(&batch_id).unwrap().unwrap();
        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.batch_id, batch_id);
    }

    #[test]
    fn missing_batch_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let missing = BatchId::generate();
        assert!(store.load_batch(&missing).unwrap().is_none());
    }

    #[test]
    fn corrupt_document_is_reported_not_half_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let batch_id = BatchId::generate();
        let path = store.batch_state_dir().join(format!("batch-{batch_id}.json"));
        std::fs::write(&path, b"{not json").unwrap();
        let err = store.load_batch(&batch_id).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[test]
    fn per_migration_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let job = sample_job();
        store.save_job(&job).unwrap();
        assert!(store.load_job(&job.migration_id).unwrap().is_some());
        store.delete_job(&job.migration_id).unwrap();
        assert!(store.load_job(&job.migration_id).unwrap().is_none());
    }

    #[test]
    fn no_tmp_file_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let batch_id = BatchId::generate();
        let state = BatchState::new(batch_id.clone(), 1, vec![]);
        store.save_batch(&state).unwrap();
        let tmp = store.batch_state_dir().join(format!("batch-{batch_id}.json.tmp"));
        assert!(!tmp.exists());
    }
}
