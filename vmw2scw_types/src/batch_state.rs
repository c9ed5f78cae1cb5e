//! The durable, whole-batch state document (§3 BatchState, §4.4 StateStore).

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::ids::BatchId;
use crate::job::VmJob;
use crate::stage::VmStatus;

/// Batch-level lifecycle status (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Complete,
    Failed,
    Partial,
}

/// The durable record of one batch run (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub current_wave: u32,
    pub total_waves: u32,
    pub jobs: Vec<VmJob>,
}

impl BatchState {
    pub fn new(batch_id: BatchId, total_waves: u32, jobs: Vec<VmJob>) -> Self {
        Self {
            batch_id,
            status: BatchStatus::Pending,
            started_at: None,
            completed_at: None,
            current_wave: 0,
            total_waves,
            jobs,
        }
    }

    /// Recompute `status` from the terminal state of every job (§3
    /// invariants):
    /// - `complete` iff every job is `complete` or `skipped`.
    /// - `partial` iff at least one `complete` and at least one `failed`.
    /// - `failed` iff no successes and at least one failure.
    /// - otherwise left unchanged (batch still in flight).
    pub fn recompute_terminal_status(&mut self) {
        let all_terminal = self
            .jobs
            .iter()
            .all(|j| matches!(j.status, VmStatus::Complete | VmStatus::Failed | VmStatus::Skipped));
        if !all_terminal {
            return;
        }
        let succeeded = self
            .jobs
            .iter()
            .filter(|j| matches!(j.status, VmStatus::Complete))
            .count();
        let failed = self
            .jobs
            .iter()
            .filter(|j| matches!(j.status, VmStatus::Failed))
            .count();
        self.status = if failed == 0 {
            BatchStatus::Complete
        } else if succeeded > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Failed
        };
    }

    pub fn job_mut(&mut self, migration_id: &crate::ids::MigrationId) -> Option<&mut VmJob> {
        self.jobs.iter_mut().find(|j| &j.migration_id == migration_id)
    }

    pub fn job(&self, migration_id: &crate::ids::MigrationId) -> Option<&VmJob> {
        self.jobs.iter().find(|j| &j.migration_id == migration_id)
    }
}
