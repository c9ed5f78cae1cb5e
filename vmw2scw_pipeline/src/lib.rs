// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-VM pipeline state machine: drives one [`vmw2scw_types::VmJob`]
//! through its OS-family-dependent stage list, checkpointing after every
//! stage so the batch orchestrator can crash and resume without re-running
//! completed work (§4.5).

pub mod error;
pub mod pipeline;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::{NoopGate, PipelineDeps, StageGate, VmPipeline};

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use vmw2scw_catalog::TypeCatalog;
    use vmw2scw_collab::fakes::{FakeInventory, FakeObjectStore, FakeSourceSession, FakeTargetClient};
    use vmw2scw_state::StateStore;
    use vmw2scw_types::{Firmware, SizingStrategy, Stage, VmJob, VmRecord, VmStatus};

    use super::*;

    fn sample_vm(name: &str) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            moref: "vm-1".into(),
            power_state: vmw2scw_types::PowerState::PoweredOn,
            cpu: 2,
            memory_mb: 4096,
            guest_os_id: "ubuntu64Guest".into(),
            guest_os_full: "Ubuntu Linux (64-bit)".into(),
            firmware: Firmware::Bios,
            disks: vec![vmw2scw_types::DiskSpec {
                size_gb: 10.0,
                thin: true,
                datastore: "ds1".into(),
                file_path: format!("[ds1] {name}/{name}.vmdk"),
                controller: vmw2scw_types::Controller::Scsi,
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

    fn deps(work_dir: &Path) -> Arc<PipelineDeps> {
        let vm = sample_vm("web-01");
        let inventory = Arc::new(FakeInventory::new(vec![vm]));
        let source = Arc::new(FakeSourceSession::new(1024));
        let target = Arc::new(FakeTargetClient::new(vec!["PRO2-XXS".to_string()]));
        let objects = Arc::new(FakeObjectStore::default());
        let catalog = Arc::new(TypeCatalog::new());
        let state = Arc::new(StateStore::open(work_dir).unwrap());

        Arc::new(PipelineDeps {
            inventory,
            source,
            target,
            objects,
            catalog,
            state,
            work_dir: work_dir.to_path_buf(),
            bucket: "migration-bucket".to_string(),
            windows_cfg: vmw2scw_adapters::windows_adapter::WindowsAdapterConfig {
                virtio_win_iso: work_dir.join("virtio-win.iso"),
                ovmf_code: work_dir.join("OVMF_CODE.fd"),
                ovmf_vars_template: work_dir.join("OVMF_VARS.fd"),
                emulator_boot_timeout: vmw2scw_adapters::windows_adapter::WindowsAdapterConfig::default_timeout(),
            },
            cancelled: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(NoopGate),
        })
    }

    fn new_job() -> VmJob {
        VmJob::new(
            "web-01",
            "PRO2-XXS",
            "fr-par-1",
            "esxi-1",
            Firmware::Bios,
            10.0,
            5,
            0,
            SizingStrategy::Optimize,
            false,
        )
    }

    #[tokio::test]
    async fn validate_populates_os_family_and_stage_completes() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = VmPipeline::new(deps(dir.path()));
        let mut job = new_job();

        pipeline.run_stage_for_test(Stage::Validate, &mut job).await.unwrap();

        assert_eq!(job.os_family, vmw2scw_types::OsFamily::Linux);
        assert!(job.artifacts.vm_info.is_some());
    }

    #[tokio::test]
    async fn resume_after_simulated_crash_does_not_repeat_completed_stages() {
        let dir = tempfile::tempdir().unwrap();
        let d = deps(dir.path());
        let pipeline = VmPipeline::new(d.clone());
        let mut job = new_job();

        pipeline.run_stage_for_test(Stage::Validate, &mut job).await.unwrap();
        job.mark_stage_complete(Stage::Validate, 0.1);
        d.state.save_job(&job).unwrap();

        // Simulate a crash: reload from disk and continue from the
        // checkpointed prefix rather than from `validate` again.
        let mut reloaded = d.state.load_job(&job.migration_id).unwrap().unwrap();
        assert_eq!(reloaded.completed_stages, vec![Stage::Validate]);

        let next = vmw2scw_types::next_stage(reloaded.os_family, &reloaded.completed_stages, reloaded.skip_validation);
        assert_eq!(next, Some(Stage::Snapshot));

        pipeline.run_stage_for_test(Stage::Snapshot, &mut reloaded).await.unwrap();
        assert!(reloaded.artifacts.snapshot_name.is_some());
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_the_next_stage_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let d = deps(dir.path());
        d.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        let pipeline = VmPipeline::new(d);
        let mut job = new_job();

        let err = pipeline.run(&mut job).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { .. }));
        assert_eq!(job.status, VmStatus::Failed);
    }

    #[tokio::test]
    async fn already_complete_job_is_a_resume_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = VmPipeline::new(deps(dir.path()));
        let mut job = new_job();
        job.status = VmStatus::Complete;
        job.artifacts.target_image_id = Some("img-done".to_string());

        pipeline.run(&mut job).await.unwrap();
        assert_eq!(job.status, VmStatus::Complete);
        assert!(job.completed_stages.is_empty());
    }
}
