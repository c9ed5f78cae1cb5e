// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Concurrent driver of many [`vmw2scw_pipeline::VmPipeline`]s: wave
//! scheduling, layered semaphore budgets, cancellation, pause/resume
//! between waves, periodic state checkpoint, and the terminal batch
//! report (§4.8 BatchOrchestrator, §3/§6 ReportGenerator).

pub mod budgets;
pub mod error;
pub mod plan_expand;
pub mod report;

pub use budgets::Budgets;
pub use error::{OrchestratorError, OrchestratorResult};
pub use plan_expand::{expand_plan, partition_waves, waves_from_jobs, WaveGroup};
pub use report::generate_report;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jiff::Timestamp;
use tokio::sync::Notify;
use tracing::instrument;

use vmw2scw_collab::ProgressSink;
use vmw2scw_pipeline::{PipelineDeps, VmPipeline};
use vmw2scw_state::StateStore;
use vmw2scw_types::{BatchId, BatchPlan, BatchState, BatchStatus, PauseAfter, VmRecord, VmStatus};

/// Drives a batch of [`vmw2scw_types::VmJob`]s to completion: one async
/// task per VM per wave, bounded by the layered [`Budgets`] already
/// installed on `deps.gate`, checkpointing to [`StateStore`] after every
/// wave and emitting [`ProgressSink`] events throughout (§4.8).
pub struct BatchOrchestrator {
    deps: Arc<PipelineDeps>,
    state: Arc<StateStore>,
    sink: Arc<dyn ProgressSink>,
    cancelled: Arc<AtomicBool>,
    pause_notify: Arc<Notify>,
}

impl BatchOrchestrator {
    /// `deps.cancelled` is shared with every spawned [`VmPipeline`], so a
    /// cancellation request unblocks pipelines already in flight at their
    /// next stage boundary (§5 "Cancellation semantics") as well as the
    /// orchestrator's own wave loop.
    pub fn new(deps: Arc<PipelineDeps>, state: Arc<StateStore>, sink: Arc<dyn ProgressSink>) -> Self {
        let cancelled = deps.cancelled.clone();
        Self { deps, state, sink, cancelled, pause_notify: Arc::new(Notify::new()) }
    }

    /// Request cancellation. Already-running stages finish (external
    /// tools don't honor cancellation mid-call); VMs not yet started in
    /// the current or a later wave become `skipped` (§5).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.pause_notify.notify_waiters();
    }

    /// Release a batch blocked at `on_wave_pause` (§4.8 "pause/resume
    /// between waves").
    pub fn unpause(&self) {
        self.pause_notify.notify_one();
    }

    /// Expand `plan` against `inventory` into jobs, partition them into
    /// waves, and drive the batch to a terminal state (§2 data flow,
    /// §4.8).
    #[instrument(skip(self, plan, inventory))]
    pub async fn run_new_batch(&self, plan: &BatchPlan, inventory: &[VmRecord]) -> OrchestratorResult<BatchState> {
        let (mut jobs, warnings) = expand_plan(plan, inventory);
        for warning in warnings {
            tracing::warn!(%warning, "plan expansion warning");
        }
        let waves = partition_waves(plan, &mut jobs);
        let batch_id = BatchId::generate();
        let mut state = BatchState::new(batch_id, waves.len() as u32, jobs);
        self.run_waves(&mut state, &waves).await?;
        Ok(state)
    }

    /// Resume a previously checkpointed batch: every `failed` job is reset
    /// to `pending` (clearing `error`/`error_stage`, incrementing
    /// `retry_count`); completed/skipped jobs are untouched. Waves are
    /// rebuilt from the `wave` field already recorded on each job, since
    /// the original plan isn't required by `batch resume --batch-id`
    /// (§4.8 "Resume", §6 CLI commands).
    #[instrument(skip(self))]
    pub async fn resume_batch(&self, batch_id: &BatchId) -> OrchestratorResult<BatchState> {
        let mut state = self
            .state
            .load_batch(batch_id)?
            .ok_or_else(|| OrchestratorError::BatchNotFound(batch_id.to_string()))?;

        for job in state.jobs.iter_mut() {
            if job.status == VmStatus::Failed {
                job.error = None;
                job.error_stage = None;
                job.retry_count += 1;
                job.status = VmStatus::Pending;
            }
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let waves = waves_from_jobs(&state.jobs);
        self.run_waves(&mut state, &waves).await?;
        Ok(state)
    }

    async fn run_waves(&self, state: &mut BatchState, waves: &[WaveGroup]) -> OrchestratorResult<()> {
        state.status = BatchStatus::Running;
        if state.started_at.is_none() {
            state.started_at = Some(Timestamp::now());
        }
        state.total_waves = waves.len() as u32;
        self.sink.on_batch_start(state.batch_id.as_str(), state.jobs.len());
        self.state.save_batch(state)?;

        for (wave_index, wave) in waves.iter().enumerate() {
            state.current_wave = wave_index as u32;

            let pending_ids: Vec<_> = wave
                .job_migration_ids
                .iter()
                .filter(|id| state.job(id).map(|j| j.status == VmStatus::Pending).unwrap_or(false))
                .cloned()
                .collect();

            if self.cancelled.load(Ordering::SeqCst) {
                // A VM that hasn't started yet becomes `skipped`, not `failed`
                // (§5 "Cancellation semantics").
                for id in &pending_ids {
                    if let Some(job) = state.job_mut(id) {
                        job.status = VmStatus::Skipped;
                    }
                }
                self.sink.on_wave_start(wave_index as u32, 0);
                self.sink.on_wave_complete(wave_index as u32, 0, 0);
                self.state.save_batch(state)?;
                continue;
            }

            self.sink.on_wave_start(wave_index as u32, pending_ids.len());

            let mut handles = Vec::with_capacity(pending_ids.len());
            for id in pending_ids {
                let Some(job) = state.job(&id).cloned() else { continue };
                let pipeline = VmPipeline::new(self.deps.clone());
                let sink = self.sink.clone();
                handles.push(tokio::spawn(run_one(pipeline, job, sink)));
            }

            let mut succeeded = 0usize;
            let mut failed = 0usize;
            for handle in handles {
                let job = handle.await.expect("vm pipeline task panicked");
                match job.status {
                    VmStatus::Complete => succeeded += 1,
                    VmStatus::Failed => failed += 1,
                    _ => {}
                }
                if let Some(slot) = state.job_mut(&job.migration_id) {
                    *slot = job;
                }
            }

            self.sink.on_wave_complete(wave_index as u32, succeeded, failed);
            self.state.save_batch(state)?;

            let is_last_wave = wave_index + 1 == waves.len();
            if !is_last_wave {
                let should_pause = match wave.pause_after {
                    PauseAfter::Continue => false,
                    PauseAfter::Pause => true,
                    PauseAfter::PauseOnFailure => failed > 0,
                };
                if should_pause {
                    state.status = BatchStatus::Paused;
                    self.state.save_batch(state)?;
                    self.sink.on_wave_pause(wave_index as u32);
                    self.pause_notify.notified().await;
                    if self.cancelled.load(Ordering::SeqCst) {
                        continue;
                    }
                    state.status = BatchStatus::Running;
                }
            }
        }

        state.recompute_terminal_status();
        if state.status == BatchStatus::Running || state.status == BatchStatus::Paused {
            // Cancellation mid-run left some jobs `skipped` but others may
            // still be `pending` from a later wave that never started; those
            // were already marked `skipped` above, so every job is terminal.
            state.status = if state.jobs.iter().any(|j| j.status == VmStatus::Complete) {
                BatchStatus::Partial
            } else {
                BatchStatus::Failed
            };
        }
        state.completed_at = Some(Timestamp::now());
        self.state.save_batch(state)?;
        self.sink.on_batch_complete(state.batch_id.as_str(), status_str(state.status));
        Ok(())
    }
}

async fn run_one(
    pipeline: VmPipeline,
    mut job: vmw2scw_types::VmJob,
    sink: Arc<dyn ProgressSink>,
) -> vmw2scw_types::VmJob {
    let migration_id = job.migration_id.to_string();
    if let Err(e) = pipeline.run(&mut job).await {
        let stage = job.error_stage.map(|s| s.name()).unwrap_or("unknown").to_string();
        sink.on_vm_failed(&migration_id, &stage, &e.to_string());
    } else if job.status == VmStatus::Complete {
        sink.on_vm_complete(&migration_id);
    }
    job
}

fn status_str(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Pending => "pending",
        BatchStatus::Running => "running",
        BatchStatus::Paused => "paused",
        BatchStatus::Complete => "complete",
        BatchStatus::Failed => "failed",
        BatchStatus::Partial => "partial",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use vmw2scw_adapters::windows_adapter::WindowsAdapterConfig;
    use vmw2scw_catalog::TypeCatalog;
    use vmw2scw_collab::fakes::{FakeInventory, FakeObjectStore, FakeSourceSession, FakeTargetClient, RecordingProgressSink};
    use vmw2scw_pipeline::NoopGate;
    use vmw2scw_types::{Concurrency, Controller, DiskSpec, ExcludeEntry, Firmware, MigrationEntry, PlanDefaults, PlanMetadata, PowerState, SizingStrategy, VmSelector, WaveSpec};

    use super::*;

    fn vm(name: &str, host: &str, priority_disk_gb: f64) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            moref: "vm-1".into(),
            power_state: PowerState::PoweredOn,
            cpu: 1,
            memory_mb: 1024,
            guest_os_id: "ubuntu64Guest".into(),
            guest_os_full: "".into(),
            firmware: Firmware::Bios,
            disks: vec![DiskSpec {
                size_gb: priority_disk_gb,
                thin: true,
                datastore: "ds1".into(),
                file_path: format!("[ds1] {name}/{name}.vmdk"),
                controller: Controller::Scsi,
                raw_device_mapping: false,
            }],
            nics: vec![],
            host: host.to_string(),
            cluster: "c1".into(),
            datacenter: "dc1".into(),
            folder: "/dc1/vm".into(),
            tags: vec![],
            tools_status: "toolsOk".into(),
            uuid: format!("u-{name}"),
            snapshots: vec![],
        }
    }

    fn base_plan(concurrency: Concurrency) -> BatchPlan {
        BatchPlan {
            version: 1,
            metadata: PlanMetadata {
                generated_at: "t".into(),
                source_id: "s".into(),
                total_vms: 0,
                linux_vms: 0,
                windows_vms: 0,
                total_disk_gb: 0.0,
            },
            defaults: PlanDefaults::default(),
            concurrency,
            migrations: vec![],
            waves: vec![],
            exclude: vec![],
        }
    }

    fn entry(name: &str, priority: u8) -> MigrationEntry {
        MigrationEntry {
            selector: VmSelector::Name { vm_name: name.to_string() },
            target_type: Some("PRO2-XXS".into()),
            zone: None,
            wave: None,
            priority,
            sizing_strategy: None,
            tags: vec![],
            network_mapping: Default::default(),
            skip_validation: None,
            notes: None,
        }
    }

    fn deps(work_dir: &std::path::Path, gate: Arc<dyn vmw2scw_pipeline::StageGate>, known_types: Vec<String>) -> Arc<PipelineDeps> {
        let inventory_vms = vec![vm("web-01", "esxi-1", 1.0)];
        Arc::new(PipelineDeps {
            inventory: Arc::new(FakeInventory::new(inventory_vms)),
            source: Arc::new(FakeSourceSession::new(16)),
            target: Arc::new(FakeTargetClient::new(known_types)),
            objects: Arc::new(FakeObjectStore::default()),
            catalog: Arc::new(TypeCatalog::new()),
            state: Arc::new(StateStore::open(work_dir).unwrap()),
            work_dir: work_dir.to_path_buf(),
            bucket: "migration-bucket".to_string(),
            windows_cfg: WindowsAdapterConfig {
                virtio_win_iso: work_dir.join("virtio-win.iso"),
                ovmf_code: work_dir.join("OVMF_CODE.fd"),
                ovmf_vars_template: work_dir.join("OVMF_VARS.fd"),
                emulator_boot_timeout: WindowsAdapterConfig::default_timeout(),
            },
            cancelled: Arc::new(AtomicBool::new(false)),
            gate,
        })
    }

    #[tokio::test]
    async fn happy_path_single_linux_vm_reaches_complete() {
        // §8 Scenario S1, orchestrator-level slice.
        let dir = tempfile::tempdir().unwrap();
        let d = deps(dir.path(), Arc::new(NoopGate), vec!["PRO2-XXS".to_string()]);
        let state_store = d.state.clone();
        let sink = Arc::new(RecordingProgressSink::default());
        let orchestrator = BatchOrchestrator::new(d, state_store, sink.clone());

        let inventory = vec![vm("web-01", "esxi-1", 1.0)];
        let mut plan = base_plan(Concurrency::default());
        plan.migrations = vec![entry("web-01", 5)];

        let state = orchestrator.run_new_batch(&plan, &inventory).await.unwrap();
        assert_eq!(state.status, BatchStatus::Complete);
        assert_eq!(state.jobs.len(), 1);
        assert!(state.jobs[0].artifacts.target_image_id.is_some());
        assert!(sink.events.lock().unwrap().iter().any(|e| e.starts_with("batch_complete")));
    }

    #[tokio::test]
    async fn waves_pause_and_resume_on_unpause_signal() {
        // §8 Scenario S3.
        let dir = tempfile::tempdir().unwrap();
        let inventory = vec![vm("a", "esxi-1", 1.0), vm("b", "esxi-1", 1.0), vm("c", "esxi-1", 1.0)];
        let d = deps(dir.path(), Arc::new(NoopGate), vec!["PRO2-XXS".to_string()]);
        let state_store = d.state.clone();
        let sink = Arc::new(RecordingProgressSink::default());
        let orchestrator = Arc::new(BatchOrchestrator::new(d, state_store, sink.clone()));

        let mut plan = base_plan(Concurrency::default());
        plan.migrations = vec![entry("a", 1), entry("b", 5), entry("c", 5)];
        plan.waves = vec![
            WaveSpec { name: "w1".into(), vms: Some(vec!["a".into()]), pause_after: PauseAfter::Pause },
            WaveSpec { name: "w2".into(), vms: Some(vec!["b".into(), "c".into()]), pause_after: PauseAfter::Continue },
        ];

        let orch = orchestrator.clone();
        let plan_clone = plan.clone();
        let inv_clone = inventory.clone();
        let run_handle = tokio::spawn(async move { orch.run_new_batch(&plan_clone, &inv_clone).await.unwrap() });

        // Give the first wave a moment to complete and hit the pause point.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(sink.events.lock().unwrap().iter().any(|e| e.starts_with("wave_pause:0")));

        orchestrator.unpause();
        let state = run_handle.await.unwrap();
        assert_eq!(state.status, BatchStatus::Complete);
        assert_eq!(state.current_wave, 1);
    }

    #[tokio::test]
    async fn cancellation_skips_not_yet_started_vms() {
        // §8 Testable Property 10.
        let dir = tempfile::tempdir().unwrap();
        let inventory = vec![vm("a", "esxi-1", 1.0), vm("b", "esxi-1", 1.0)];
        let d = deps(dir.path(), Arc::new(NoopGate), vec!["PRO2-XXS".to_string()]);
        let state_store = d.state.clone();
        let sink = Arc::new(RecordingProgressSink::default());
        let orchestrator = BatchOrchestrator::new(d, state_store, sink);

        let mut plan = base_plan(Concurrency::default());
        plan.migrations = vec![entry("a", 1), entry("b", 5)];
        plan.waves = vec![
            WaveSpec { name: "w1".into(), vms: Some(vec!["a".into()]), pause_after: PauseAfter::Pause },
            WaveSpec { name: "w2".into(), vms: Some(vec!["b".into()]), pause_after: PauseAfter::Continue },
        ];

        orchestrator.cancel();
        let state = orchestrator.run_new_batch(&plan, &inventory).await.unwrap();
        let b = state.jobs.iter().find(|j| j.vm_name == "b").unwrap();
        assert_eq!(b.status, VmStatus::Skipped);
    }

    #[tokio::test]
    async fn exclusion_and_pattern_end_to_end() {
        // §8 Scenario S6, orchestrator-level.
        let dir = tempfile::tempdir().unwrap();
        let inventory = vec![vm("web-01", "esxi-1", 1.0), vm("web-02", "esxi-1", 1.0), vm("db-01", "esxi-1", 1.0), vm("template-ubuntu", "esxi-1", 1.0)];
        let d = deps(dir.path(), Arc::new(NoopGate), vec!["PRO2-XXS".to_string()]);
        let state_store = d.state.clone();
        let sink = Arc::new(RecordingProgressSink::default());
        let orchestrator = BatchOrchestrator::new(d, state_store, sink);

        let mut plan = base_plan(Concurrency::default());
        plan.migrations = vec![
            MigrationEntry { selector: VmSelector::Pattern { vm_pattern: "web-*".into() }, ..entry("unused", 5) },
            MigrationEntry { selector: VmSelector::Pattern { vm_pattern: "db-*".into() }, ..entry("unused", 5) },
        ];
        plan.exclude = vec![ExcludeEntry { selector: VmSelector::Pattern { vm_pattern: "template-*".into() } }];

        let state = orchestrator.run_new_batch(&plan, &inventory).await.unwrap();
        let mut names: Vec<_> = state.jobs.iter().map(|j| j.vm_name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["db-01", "web-01", "web-02"]);
    }
}
