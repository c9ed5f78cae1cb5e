//! The runtime record for one VM within a batch (§3 VMJob).

use std::collections::HashMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactBag;
use crate::ids::MigrationId;
use crate::plan::SizingStrategy;
use crate::stage::{is_valid_prefix, OsFamily, Stage, VmStatus};

/// Runtime record for one VM moving through a batch (§3 VMJob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmJob {
    pub vm_name: String,
    pub migration_id: MigrationId,
    pub target_type: String,
    pub zone: String,
    pub os_family: OsFamily,
    pub source_host: String,
    pub firmware: crate::vm_record::Firmware,
    pub total_disk_gb: f64,
    pub priority: u8,
    pub wave: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub network_mapping: HashMap<String, String>,
    pub sizing_strategy: SizingStrategy,
    pub skip_validation: bool,
    pub status: VmStatus,
    pub current_stage: Option<Stage>,
    /// Strict, duplicate-free prefix of the nominal stage list (§3, §8
    /// Testable Property 1).
    #[serde(default)]
    pub completed_stages: Vec<Stage>,
    #[serde(default)]
    pub stage_timings: HashMap<String, f64>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    #[serde(default)]
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_stage: Option<Stage>,
    #[serde(default)]
    pub artifacts: ArtifactBag,
}

impl VmJob {
    /// Construct a brand-new, `pending` job for `vm_name`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vm_name: impl Into<String>,
        target_type: impl Into<String>,
        zone: impl Into<String>,
        source_host: impl Into<String>,
        firmware: crate::vm_record::Firmware,
        total_disk_gb: f64,
        priority: u8,
        wave: u32,
        sizing_strategy: SizingStrategy,
        skip_validation: bool,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            migration_id: MigrationId::generate(),
            target_type: target_type.into(),
            zone: zone.into(),
            os_family: OsFamily::Unknown,
            source_host: source_host.into(),
            firmware,
            total_disk_gb,
            priority,
            wave,
            tags: Vec::new(),
            network_mapping: HashMap::new(),
            sizing_strategy,
            skip_validation,
            status: VmStatus::Pending,
            current_stage: None,
            completed_stages: Vec::new(),
            stage_timings: HashMap::new(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error: None,
            error_stage: None,
            artifacts: ArtifactBag::new(),
        }
    }

    /// §3 invariant: `completed_stages` is a strict, duplicate-free prefix
    /// of the nominal order for this job's OS family, minus skipped
    /// stages.
    pub fn has_valid_stage_prefix(&self) -> bool {
        is_valid_prefix(self.os_family, self.skip_validation, &self.completed_stages)
    }

    /// §3 invariant: once `complete`, `artifacts.target_image_id` is
    /// non-empty.
    pub fn has_valid_completion_artifacts(&self) -> bool {
        if self.status != VmStatus::Complete {
            return true;
        }
        self.artifacts
            .target_image_id
            .as_ref()
            .is_some_and(|id| !id.is_empty())
    }

    pub fn mark_stage_complete(&mut self, stage: Stage, duration_secs: f64) {
        if !self.completed_stages.contains(&stage) {
            self.completed_stages.push(stage);
        }
        self.stage_timings.insert(stage.name().to_string(), duration_secs);
    }

    /// Reset a failed job so it can be re-attempted (§4.5 "resume",
    /// §4.8 orchestrator-level "resume").
    pub fn reset_for_retry(&mut self) {
        self.error = None;
        self.error_stage = None;
        self.retry_count += 1;
        self.status = self
            .current_stage
            .map(|s| s.running_status())
            .unwrap_or(VmStatus::Pending);
    }
}
