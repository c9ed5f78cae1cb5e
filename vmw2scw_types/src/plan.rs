//! The persisted migration plan document (§3 BatchPlan, §6 "Plan document").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What to do between waves once the current one finishes (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseAfter {
    Continue,
    Pause,
    PauseOnFailure,
}

impl Default for PauseAfter {
    fn default() -> Self {
        PauseAfter::Continue
    }
}

/// Plan-wide metadata, computed by [`vmw2scw_plan::build_plan`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub generated_at: String,
    pub source_id: String,
    pub total_vms: u32,
    pub linux_vms: u32,
    pub windows_vms: u32,
    pub total_disk_gb: f64,
}

/// Plan-wide defaults, overridable per migration entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefaults {
    pub zone: String,
    pub sizing_strategy: SizingStrategy,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub network_mapping: HashMap<String, String>,
    #[serde(default)]
    pub skip_validation: bool,
}

impl Default for PlanDefaults {
    fn default() -> Self {
        Self {
            zone: "fr-par-1".to_string(),
            sizing_strategy: SizingStrategy::Optimize,
            tags: Vec::new(),
            network_mapping: HashMap::new(),
            skip_validation: false,
        }
    }
}

/// Instance-sizing strategy (§4.1 Mapper.suggest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizingStrategy {
    Exact,
    Optimize,
    Cost,
}

/// Concurrency budgets (§4.8), with the spec's stated defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Concurrency {
    pub max_total_workers: u32,
    pub max_exports_per_host: u32,
    pub max_concurrent_conversions: u32,
    pub max_concurrent_uploads: u32,
    pub max_concurrent_imports: u32,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            max_total_workers: 10,
            max_exports_per_host: 4,
            max_concurrent_conversions: 3,
            max_concurrent_uploads: 6,
            max_concurrent_imports: 5,
        }
    }
}

/// How a migration entry selects a VM: exact name or a glob pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VmSelector {
    Name { vm_name: String },
    Pattern { vm_pattern: String },
}

impl VmSelector {
    pub fn pattern(&self) -> &str {
        match self {
            VmSelector::Name { vm_name } => vm_name,
            VmSelector::Pattern { vm_pattern } => vm_pattern,
        }
    }
}

/// One entry in `migrations[]` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationEntry {
    #[serde(flatten)]
    pub selector: VmSelector,
    pub target_type: Option<String>,
    pub zone: Option<String>,
    pub wave: Option<u32>,
    /// 1 is highest priority; valid range is `[1, 9]`.
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub sizing_strategy: Option<SizingStrategy>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub network_mapping: HashMap<String, String>,
    pub skip_validation: Option<bool>,
    pub notes: Option<String>,
}

fn default_priority() -> u8 {
    5
}

/// One entry in `exclude[]` (§3): subtracted last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludeEntry {
    #[serde(flatten)]
    pub selector: VmSelector,
}

/// One wave definition (§3). If `waves` is empty in the plan document,
/// waves are implicit: derived from `priority`, one wave per distinct
/// priority value, ascending (§3, §8 Testable Property 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveSpec {
    pub name: String,
    pub vms: Option<Vec<String>>,
    #[serde(default)]
    pub pause_after: PauseAfter,
}

/// The full persisted migration plan (§3 BatchPlan).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    pub version: u32,
    pub metadata: PlanMetadata,
    pub defaults: PlanDefaults,
    #[serde(default)]
    pub concurrency: Concurrency,
    pub migrations: Vec<MigrationEntry>,
    #[serde(default)]
    pub waves: Vec<WaveSpec>,
    #[serde(default)]
    pub exclude: Vec<ExcludeEntry>,
}
