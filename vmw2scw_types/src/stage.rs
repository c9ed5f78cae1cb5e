//! Pipeline stages and the OS-family-dependent ordering between them
//! (§4.5, and §9 "Stage list reshape after `validate`").

use serde::{Deserialize, Serialize};

/// OS family of a VM, known only after `validate` runs (§3 VMJob).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
    Unknown,
}

/// A single stage in a VM's migration pipeline.
///
/// The Linux sequence has 10 stages, the Windows sequence 12 (§4.5); the
/// two sequences share every other stage name, differing only in the
/// guest-adaptation steps between `convert` and `ensure_uefi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Snapshot,
    Export,
    Convert,
    /// Linux-only: §4.5 `adapt_guest`.
    AdaptGuest,
    /// Windows-only: §4.5 `clean_tools`.
    CleanTools,
    /// Windows-only: §4.5/§4.6 `inject_virtio`.
    InjectVirtio,
    /// Windows-only: §4.5 `fix_bootloader` (no-op by design, see §4.5).
    FixBootloader,
    EnsureUefi,
    Upload,
    Import,
    Verify,
    Cleanup,
}

impl Stage {
    /// Human-readable name, matching the lowercase snake_case wire form.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Snapshot => "snapshot",
            Stage::Export => "export",
            Stage::Convert => "convert",
            Stage::AdaptGuest => "adapt_guest",
            Stage::CleanTools => "clean_tools",
            Stage::InjectVirtio => "inject_virtio",
            Stage::FixBootloader => "fix_bootloader",
            Stage::EnsureUefi => "ensure_uefi",
            Stage::Upload => "upload",
            Stage::Import => "import",
            Stage::Verify => "verify",
            Stage::Cleanup => "cleanup",
        }
    }

    /// The ordered, full stage list for Linux VMs (§4.5).
    pub const LINUX_ORDER: &'static [Stage] = &[
        Stage::Validate,
        Stage::Snapshot,
        Stage::Export,
        Stage::Convert,
        Stage::AdaptGuest,
        Stage::EnsureUefi,
        Stage::Upload,
        Stage::Import,
        Stage::Verify,
        Stage::Cleanup,
    ];

    /// The ordered, full stage list for Windows VMs (§4.5).
    pub const WINDOWS_ORDER: &'static [Stage] = &[
        Stage::Validate,
        Stage::Snapshot,
        Stage::Export,
        Stage::Convert,
        Stage::CleanTools,
        Stage::InjectVirtio,
        Stage::FixBootloader,
        Stage::EnsureUefi,
        Stage::Upload,
        Stage::Import,
        Stage::Verify,
        Stage::Cleanup,
    ];

    /// The nominal (full, unfiltered) stage order for an OS family.
    ///
    /// The pipeline always *starts* on the Linux sequence (§4.5: "the
    /// pipeline starts on the Linux sequence") since `os_family` is unknown
    /// until `validate` completes; `Unknown` therefore also returns the
    /// Linux order.
    pub fn nominal_order(family: OsFamily) -> &'static [Stage] {
        match family {
            OsFamily::Windows => Stage::WINDOWS_ORDER,
            OsFamily::Linux | OsFamily::Unknown => Stage::LINUX_ORDER,
        }
    }

    /// The nominal stage list for `family`, minus stages removed by options
    /// (today: `skip_validation` removes only `validate`, §4.5).
    pub fn effective_order(family: OsFamily, skip_validation: bool) -> Vec<Stage> {
        Stage::nominal_order(family)
            .iter()
            .copied()
            .filter(|s| !(skip_validation && *s == Stage::Validate))
            .collect()
    }

    /// The VMStatus this stage maps to while it is running (§3 "Mapping
    /// from stage to status is many-to-one").
    pub fn running_status(&self) -> VmStatus {
        match self {
            Stage::Validate => VmStatus::Validating,
            Stage::Snapshot | Stage::Export => VmStatus::Exporting,
            Stage::Convert => VmStatus::Converting,
            Stage::AdaptGuest
            | Stage::CleanTools
            | Stage::InjectVirtio
            | Stage::FixBootloader
            | Stage::EnsureUefi => VmStatus::Adapting,
            Stage::Upload => VmStatus::Uploading,
            Stage::Import => VmStatus::Importing,
            Stage::Verify => VmStatus::Verifying,
            Stage::Cleanup => VmStatus::Cleaning,
        }
    }
}

/// The closed set of VM migration statuses (§3 VMStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Pending,
    Validating,
    Exporting,
    Converting,
    Adapting,
    Uploading,
    Importing,
    Verifying,
    Cleaning,
    Complete,
    Failed,
    Skipped,
}

/// Given the OS family, the stages already completed, and whether
/// `skip_validation` is set, compute the next stage to run, or `None` if
/// the job is done.
///
/// This is the explicit "compute next stage" function called for by the
/// design notes: a late-bound edge list rather than a fixed DAG, since the
/// stage list is rebuilt once `os_family` becomes known.
pub fn next_stage(
    family: OsFamily,
    completed_stages: &[Stage],
    skip_validation: bool,
) -> Option<Stage> {
    Stage::effective_order(family, skip_validation)
        .into_iter()
        .find(|s| !completed_stages.contains(s))
}

/// Verify `completed_stages` is a strict, duplicate-free prefix of the
/// effective order for `family` (§8 Testable Property 1).
pub fn is_valid_prefix(family: OsFamily, skip_validation: bool, completed_stages: &[Stage]) -> bool {
    let order = Stage::effective_order(family, skip_validation);
    if completed_stages.len() > order.len() {
        return false;
    }
    let mut seen = std::collections::HashSet::new();
    for (i, stage) in completed_stages.iter().enumerate() {
        if order[i] != *stage {
            return false;
        }
        if !seen.insert(*stage) {
            return false;
        }
    }
    true
}
