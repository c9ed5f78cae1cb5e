// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared data model for the vmware2scw batch migration engine: the VM
//! record read from the source inventory, the target instance type
//! catalog's shape, the persisted plan and state documents, and the
//! per-VM job/artifact bookkeeping that lets a pipeline resume after any
//! interruption.

pub mod artifacts;
pub mod batch_state;
pub mod ids;
pub mod instance_type;
pub mod job;
pub mod plan;
pub mod stage;
pub mod vm_record;

pub use artifacts::ArtifactBag;
pub use batch_state::{BatchState, BatchStatus};
pub use ids::{BatchId, MigrationId};
pub use instance_type::{Category, InstanceTypeSpec};
pub use job::VmJob;
pub use plan::{
    BatchPlan, Concurrency, ExcludeEntry, MigrationEntry, PauseAfter, PlanDefaults, PlanMetadata,
    SizingStrategy, VmSelector, WaveSpec,
};
pub use stage::{is_valid_prefix, next_stage, OsFamily, Stage, VmStatus};
pub use vm_record::{Controller, DiskSpec, Firmware, NicSpec, PowerState, SnapshotRef, VmRecord};

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vm() -> VmRecord {
        VmRecord {
            name: "web-01".into(),
            moref: "vm-100".into(),
            power_state: PowerState::PoweredOn,
            cpu: 2,
            memory_mb: 4096,
            guest_os_id: "ubuntu64Guest".into(),
            guest_os_full: "Ubuntu Linux (64-bit)".into(),
            firmware: Firmware::Bios,
            disks: vec![DiskSpec {
                size_gb: 40.0,
                thin: true,
                datastore: "ds1".into(),
                file_path: "[ds1] web-01/web-01.vmdk".into(),
                controller: Controller::Scsi,
                raw_device_mapping: false,
            }],
            nics: vec![],
            host: "esxi-1".into(),
            cluster: "cluster-a".into(),
            datacenter: "dc-1".into(),
            folder: "/dc-1/vm".into(),
            tags: vec![],
            tools_status: "toolsOk".into(),
            uuid: "uuid-1".into(),
            snapshots: vec![],
        }
    }

    #[test]
    fn boot_disk_is_index_zero() {
        let vm = sample_vm();
        assert_eq!(vm.boot_disk().unwrap().datastore, "ds1");
    }

    #[test]
    fn linux_stage_order_has_ten_stages() {
        assert_eq!(Stage::LINUX_ORDER.len(), 10);
        assert_eq!(Stage::WINDOWS_ORDER.len(), 12);
    }

    #[test]
    fn next_stage_starts_at_validate() {
        assert_eq!(next_stage(OsFamily::Unknown, &[], false), Some(Stage::Validate));
    }

    #[test]
    fn skip_validation_removes_only_validate() {
        let order = Stage::effective_order(OsFamily::Linux, true);
        assert!(!order.contains(&Stage::Validate));
        assert_eq!(order.len(), 9);
        assert_eq!(next_stage(OsFamily::Linux, &[], true), Some(Stage::Snapshot));
    }

    #[test]
    fn windows_sequence_diverges_after_convert() {
        let next = next_stage(
            OsFamily::Windows,
            &[Stage::Validate, Stage::Snapshot, Stage::Export, Stage::Convert],
            false,
        );
        assert_eq!(next, Some(Stage::CleanTools));
    }

    #[test]
    fn valid_prefix_rejects_out_of_order() {
        assert!(!is_valid_prefix(
            OsFamily::Linux,
            false,
            &[Stage::Snapshot, Stage::Validate]
        ));
        assert!(is_valid_prefix(
            OsFamily::Linux,
            false,
            &[Stage::Validate, Stage::Snapshot]
        ));
    }

    #[test]
    fn valid_prefix_rejects_duplicates() {
        assert!(!is_valid_prefix(
            OsFamily::Linux,
            false,
            &[Stage::Validate, Stage::Validate]
        ));
    }

    #[test]
    fn batch_status_complete_iff_all_complete_or_skipped() {
        let mut job_a = VmJob::new(
            "a",
            "PRO2-XXS",
            "fr-par-1",
            "esxi-1",
            Firmware::Bios,
            10.0,
            5,
            0,
            SizingStrategy::Optimize,
            false,
        );
        job_a.status = VmStatus::Complete;
        job_a.artifacts.target_image_id = Some("img-1".into());
        let mut job_b = job_a.clone();
        job_b.status = VmStatus::Skipped;

        let mut state = BatchState::new(BatchId::generate(), 1, vec![job_a, job_b]);
        state.recompute_terminal_status();
        assert_eq!(state.status, BatchStatus::Complete);
    }

    #[test]
    fn batch_status_partial_requires_one_success_one_failure() {
        let mut job_a = VmJob::new(
            "a", "PRO2-XXS", "fr-par-1", "esxi-1", Firmware::Bios, 10.0, 5, 0,
            SizingStrategy::Optimize, false,
        );
        job_a.status = VmStatus::Complete;
        job_a.artifacts.target_image_id = Some("img-1".into());
        let mut job_b = job_a.clone();
        job_b.status = VmStatus::Failed;
        job_b.artifacts.target_image_id = None;

        let mut state = BatchState::new(BatchId::generate(), 1, vec![job_a, job_b]);
        state.recompute_terminal_status();
        assert_eq!(state.status, BatchStatus::Partial);
    }

    #[test]
    fn completion_artifact_invariant() {
        let mut job = VmJob::new(
            "a", "PRO2-XXS", "fr-par-1", "esxi-1", Firmware::Bios, 10.0, 5, 0,
            SizingStrategy::Optimize, false,
        );
        job.status = VmStatus::Complete;
        assert!(!job.has_valid_completion_artifacts());
        job.artifacts.target_image_id = Some("img-1".into());
        assert!(job.has_valid_completion_artifacts());
    }

    #[test]
    fn plan_roundtrip_through_json() {
        let plan = BatchPlan {
            version: 1,
            metadata: PlanMetadata {
                generated_at: "2026-07-28T00:00:00Z".into(),
                source_id: "vcenter-1".into(),
                total_vms: 1,
                linux_vms: 1,
                windows_vms: 0,
                total_disk_gb: 40.0,
            },
            defaults: PlanDefaults::default(),
            concurrency: Concurrency::default(),
            migrations: vec![MigrationEntry {
                selector: VmSelector::Name { vm_name: "web-01".into() },
                target_type: Some("PRO2-XXS".into()),
                zone: None,
                wave: None,
                priority: 5,
                sizing_strategy: None,
                tags: vec![],
                network_mapping: Default::default(),
                skip_validation: None,
                notes: None,
            }],
            waves: vec![],
            exclude: vec![],
        };
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: BatchPlan = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, json2);
    }
}
