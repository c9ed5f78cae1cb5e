//! Per-VM state machine: drives a [`VmJob`] stage by stage, persisting a
//! checkpoint after every stage and supporting cooperative resume from
//! wherever `completed_stages` left off (§4.5 VMPipeline).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tracing::instrument;

use vmw2scw_adapters::windows_adapter::WindowsAdapterConfig;
use vmw2scw_adapters::{bios2uefi, linux_adapter, windows_adapter};
use vmw2scw_catalog::TypeCatalog;
use vmw2scw_collab::{CollabError, ExportLease, InventorySource, ObjectStore, RemoteState, SourceSession, TargetClient};
use vmw2scw_proc::{run, CommandSpec};
use vmw2scw_state::StateStore;
use vmw2scw_types::{next_stage, OsFamily, Stage, VmJob, VmStatus};

use crate::error::{PipelineError, PipelineResult};

/// Collaborators and configuration shared by every pipeline run (§6).
pub struct PipelineDeps {
    pub inventory: Arc<dyn InventorySource>,
    pub source: Arc<dyn SourceSession>,
    pub target: Arc<dyn TargetClient>,
    pub objects: Arc<dyn ObjectStore>,
    pub catalog: Arc<TypeCatalog>,
    pub state: Arc<StateStore>,
    pub work_dir: PathBuf,
    pub bucket: String,
    pub windows_cfg: WindowsAdapterConfig,
    /// Cooperative cancellation flag, checked at every stage boundary
    /// (§5 "Cancellation semantics").
    pub cancelled: Arc<AtomicBool>,
    /// Resource budget gate consulted before every stage (§4.8
    /// "Stage-to-budget mapping"). Defaults to [`NoopGate`] for callers
    /// that don't need layered concurrency limits (e.g. the single-VM
    /// `migrate` CLI command).
    pub gate: Arc<dyn StageGate>,
}

/// A resource gate consulted before running a stage, returning an opaque
/// permit held for the stage's duration and dropped afterwards. The
/// batch orchestrator supplies an implementation backed by layered
/// semaphores (§4.8); outside a batch run, [`NoopGate`] grants instantly.
#[async_trait::async_trait]
pub trait StageGate: Send + Sync {
    async fn acquire(&self, stage: Stage, source_host: &str) -> Box<dyn Send>;
}

/// Grants every stage immediately, holding nothing.
pub struct NoopGate;

#[async_trait::async_trait]
impl StageGate for NoopGate {
    async fn acquire(&self, _stage: Stage, _source_host: &str) -> Box<dyn Send> {
        Box::new(())
    }
}

struct NoopLease;
#[async_trait::async_trait]
impl ExportLease for NoopLease {
    async fn keepalive(&self, _percent_complete: f64) -> vmw2scw_collab::CollabResult<()> {
        Ok(())
    }
}

pub struct VmPipeline {
    deps: Arc<PipelineDeps>,
}

impl VmPipeline {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }

    fn scratch_dir(&self, job: &VmJob) -> PathBuf {
        self.deps.work_dir.join(job.migration_id.as_str())
    }

    /// Run `job` to a terminal state: `complete` or `failed`. Already-
    /// `complete`/`skipped` jobs are a no-op and return `Ok(())`
    /// immediately (§8 Property 3, resume idempotence).
    #[instrument(skip(self, job), fields(vm = %job.vm_name, migration_id = %job.migration_id))]
    pub async fn run(&self, job: &mut VmJob) -> PipelineResult<()> {
        if matches!(job.status, VmStatus::Complete | VmStatus::Skipped) {
            return Ok(());
        }
        if job.started_at.is_none() {
            job.started_at = Some(now());
        }

        loop {
            if self.deps.cancelled.load(Ordering::SeqCst) {
                let stage = job.current_stage.unwrap_or(Stage::Validate);
                job.status = VmStatus::Failed;
                job.error = Some("cancelled".to_string());
                job.error_stage = Some(stage);
                self.checkpoint(job).await?;
                return Err(PipelineError::Cancelled { stage });
            }

            let Some(stage) = next_stage(job.os_family, &job.completed_stages, job.skip_validation) else {
                job.status = VmStatus::Complete;
                job.completed_at = Some(now());
                self.checkpoint(job).await?;
                return Ok(());
            };

            job.current_stage = Some(stage);
            job.status = stage.running_status();
            let started = std::time::Instant::now();

            let _permit = self.deps.gate.acquire(stage, &job.source_host).await;
            if let Err(e) = self.run_stage(stage, job).await {
                job.status = VmStatus::Failed;
                job.error = Some(e.to_string());
                job.error_stage = Some(stage);
                self.checkpoint(job).await?;
                return Err(e);
            }

            job.mark_stage_complete(stage, started.elapsed().as_secs_f64());
            self.checkpoint(job).await?;
        }
    }

    /// Resume a failed job: clear the error, rebuild the remaining stage
    /// list from the OS family already recorded, bump `retry_count`, and
    /// continue from `completed_stages` (§4.5 "Resume").
    pub async fn resume(&self, job: &mut VmJob) -> PipelineResult<()> {
        job.reset_for_retry();
        self.run(job).await
    }

    async fn checkpoint(&self, job: &VmJob) -> PipelineResult<()> {
        self.deps.state.save_job(job)?;
        Ok(())
    }

    /// Test-only entry point for exercising a single stage body in
    /// isolation, bypassing the `next_stage` loop and checkpointing.
    #[cfg(test)]
    pub async fn run_stage_for_test(&self, stage: Stage, job: &mut VmJob) -> PipelineResult<()> {
        self.run_stage(stage, job).await
    }

    async fn run_stage(&self, stage: Stage, job: &mut VmJob) -> PipelineResult<()> {
        match stage {
            Stage::Validate => self.stage_validate(job).await,
            Stage::Snapshot => self.stage_snapshot(job).await,
            Stage::Export => self.stage_export(job).await,
            Stage::Convert => self.stage_convert(job).await,
            Stage::AdaptGuest => self.stage_adapt_guest(job).await,
            Stage::CleanTools => self.stage_clean_tools(job).await,
            Stage::InjectVirtio => self.stage_inject_virtio(job).await,
            Stage::FixBootloader => Ok(()), // no-op by design, §4.5.
            Stage::EnsureUefi => self.stage_ensure_uefi(job).await,
            Stage::Upload => self.stage_upload(job).await,
            Stage::Import => self.stage_import(job).await,
            Stage::Verify => self.stage_verify(job).await,
            Stage::Cleanup => self.stage_cleanup(job).await,
        }
    }

    async fn stage_validate(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::Validate;
        let vm = self
            .deps
            .inventory
            .get_vm(&job.vm_name)
            .await
            .map_err(|e| collab_err(stage, e))?;

        let (family, _label) = vmw2scw_catalog::classify(&vm.guest_os_id);
        job.os_family = family;
        job.firmware = vm.firmware;
        job.total_disk_gb = vm.total_disk_gb();

        if job.skip_validation {
            job.artifacts.vm_info = Some(vm);
            return Ok(());
        }

        if !self.deps.target.instance_type_exists(&job.target_type).await.map_err(|e| collab_err(stage, e))? {
            return Err(PipelineError::Precondition {
                stage,
                message: format!("target type {} unknown to target catalog", job.target_type),
            });
        }
        let issues = vmw2scw_catalog::mapper::validate(
            &self.deps.catalog,
            &job.target_type,
            vm.cpu,
            vm.memory_mb,
            vm.total_disk_gb(),
            vm.disks.len() as u32,
            family == OsFamily::Windows,
        );
        if !issues.is_empty() {
            return Err(PipelineError::Precondition { stage, message: issues.join("; ") });
        }
        if vm.has_raw_device_mapping() {
            return Err(PipelineError::Precondition {
                stage,
                message: "VM has a raw-device-mapping disk, which cannot be exported".to_string(),
            });
        }
        if vm.snapshots.len() > 3 {
            tracing::warn!(vm = %vm.name, count = vm.snapshots.len(), "VM has more than 3 snapshots");
        }

        job.artifacts.vm_info = Some(vm);
        Ok(())
    }

    async fn stage_snapshot(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::Snapshot;
        let snapshot_name = format!("vmware2scw-{}", job.migration_id);
        match self.deps.source.create_snapshot(&job.vm_name, &snapshot_name, true).await {
            Ok(()) => {}
            Err(CollabError::Transient(_)) => {
                // Quiesce-specific failure: fall back to a non-quiesced snapshot.
                self.deps
                    .source
                    .create_snapshot(&job.vm_name, &snapshot_name, false)
                    .await
                    .map_err(|e| collab_err(stage, e))?;
            }
            Err(e) => return Err(collab_err(stage, e)),
        }
        job.artifacts.snapshot_name = Some(snapshot_name);
        Ok(())
    }

    async fn stage_export(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::Export;
        let vm = job.artifacts.vm_info.clone().ok_or_else(|| PipelineError::Precondition {
            stage,
            message: "vm_info missing; validate must run first".to_string(),
        })?;
        tokio::fs::create_dir_all(self.scratch_dir(job)).await.map_err(|e| io_err(stage, e))?;

        let mut disk_paths = Vec::with_capacity(vm.disks.len());
        for (idx, disk) in vm.disks.iter().enumerate() {
            let dest = self.scratch_dir(job).join(format!("{}-disk{idx}.vmdk", job.vm_name));
            if let Ok(meta) = tokio::fs::metadata(&dest).await {
                if (meta.len() as f64 - disk.size_gb * 1024.0 * 1024.0 * 1024.0).abs() < 1.0 {
                    disk_paths.push(dest.display().to_string());
                    continue;
                }
            }
            self.deps
                .source
                .download_disk(&job.vm_name, idx, &dest, &NoopLease)
                .await
                .map_err(|e| collab_err(stage, e))?;
            disk_paths.push(dest.display().to_string());
        }
        job.artifacts.disk_paths = disk_paths;
        Ok(())
    }

    async fn stage_convert(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::Convert;
        let compress = job.os_family != OsFamily::Windows;
        let mut image_paths = Vec::with_capacity(job.artifacts.disk_paths.len());

        for disk_path in job.artifacts.disk_paths.clone() {
            let qcow2_path = Path::new(&disk_path).with_extension("qcow2");
            if integrity_check(&qcow2_path).await.unwrap_or(false) {
                image_paths.push(qcow2_path.display().to_string());
                continue;
            }

            let mut args = vec!["convert".to_string(), "-O".to_string(), "qcow2".to_string()];
            if compress {
                args.push("-c".to_string());
            }
            args.push(disk_path.clone());
            args.push(qcow2_path.display().to_string());
            let spec = CommandSpec::new("qemu-img", args).progress_pattern(r"\((\d+(?:\.\d+)?)/100%\)");
            run(&spec, None).await.map_err(|e| PipelineError::Tool { stage, source: e })?;

            if !integrity_check(&qcow2_path).await.unwrap_or(false) {
                return Err(PipelineError::Integrity { stage, message: format!("{} failed post-convert integrity check", qcow2_path.display()) });
            }
            tokio::fs::remove_file(&disk_path).await.ok();
            image_paths.push(qcow2_path.display().to_string());
        }
        job.artifacts.image_paths = image_paths;
        Ok(())
    }

    async fn stage_adapt_guest(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::AdaptGuest;
        let boot = self.boot_image_path(job, stage)?;
        let outcome = linux_adapter::adapt_guest(Path::new(&boot), job.firmware == vmw2scw_types::Firmware::Efi)
            .await
            .map_err(|e| adapter_err(stage, e))?;
        if !outcome.tool_exit_success {
            tracing::warn!(stderr_tail = %outcome.stderr_tail, "adapt_guest: virt-customize exited non-zero");
        }
        Ok(())
    }

    async fn stage_clean_tools(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::CleanTools;
        let boot = self.boot_image_path(job, stage)?;
        let spec = CommandSpec::new(
            "virt-customize",
            [
                "-a".to_string(),
                boot,
                "--run-command=(wmic product where \"name like 'VMware Tools'\" call uninstall /nointeractive) 2>nul || exit /b 0".to_string(),
            ],
        )
        .check(false);
        run(&spec, None).await.map_err(|e| PipelineError::Tool { stage, source: e })?;
        Ok(())
    }

    async fn stage_inject_virtio(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::InjectVirtio;
        let boot = self.boot_image_path(job, stage)?;
        let staging_dir = self.scratch_dir(job).join("virtio-phase1");

        windows_adapter::offline_prepare(Path::new(&boot), &staging_dir, &self.deps.windows_cfg)
            .await
            .map_err(|e| adapter_err(stage, e))?;

        let overlay = self.scratch_dir(job).join("virtio-overlay.qcow2");
        let create_overlay = CommandSpec::new(
            "qemu-img",
            [
                "create".to_string(),
                "-f".to_string(),
                "qcow2".to_string(),
                "-F".to_string(),
                "qcow2".to_string(),
                "-b".to_string(),
                boot.clone(),
                overlay.display().to_string(),
            ],
        );
        run(&create_overlay, None).await.map_err(|e| PipelineError::Tool { stage, source: e })?;

        let vars_path = self.scratch_dir(job).join("ovmf-vars.fd");
        let serial_log = self.scratch_dir(job).join("virtio-serial.log");
        let outcome = windows_adapter::controlled_boot(&overlay, &vars_path, &serial_log, &self.deps.windows_cfg)
            .await
            .map_err(|e| adapter_err(stage, e))?;
        if !outcome.completed_before_timeout {
            return Err(PipelineError::Timeout {
                stage,
                message: format!("phases observed before timeout: {:?}", outcome.phases_observed),
            });
        }

        let commit = CommandSpec::new("qemu-img", ["commit".to_string(), overlay.display().to_string()]);
        run(&commit, None).await.map_err(|e| PipelineError::Tool { stage, source: e })?;
        tokio::fs::remove_file(&overlay).await.ok();
        Ok(())
    }

    async fn stage_ensure_uefi(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::EnsureUefi;
        let boot = self.boot_image_path(job, stage)?;
        if job.os_family == OsFamily::Windows {
            let scratch = self.scratch_dir(job).join("bios2uefi");
            bios2uefi::ensure_windows_uefi(Path::new(&boot), &scratch, &self.deps.windows_cfg)
                .await
                .map_err(|e| adapter_err(stage, e))?;
        } else {
            let scratch = self.scratch_dir(job).join("bios2uefi").join("disk.raw");
            tokio::fs::create_dir_all(scratch.parent().unwrap()).await.map_err(|e| io_err(stage, e))?;
            bios2uefi::convert_linux(Path::new(&boot), &scratch)
                .await
                .map_err(|e| adapter_err(stage, e))?;
        }
        Ok(())
    }

    async fn stage_upload(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::Upload;
        let mut object_keys = Vec::with_capacity(job.artifacts.image_paths.len());
        for image_path in job.artifacts.image_paths.clone() {
            let filename = Path::new(&image_path).file_name().unwrap().to_string_lossy().to_string();
            let key = format!("migrations/{}/{filename}", job.migration_id);
            let local_size = tokio::fs::metadata(&image_path).await.map_err(|e| io_err(stage, e))?.len();
            let existing = self.deps.objects.head(&self.deps.bucket, &key).await.map_err(|e| collab_err(stage, e))?;
            if existing != Some(local_size) {
                self.deps
                    .objects
                    .put(&self.deps.bucket, &key, Path::new(&image_path))
                    .await
                    .map_err(|e| collab_err(stage, e))?;
            }
            object_keys.push(key);
        }
        job.artifacts.object_keys = object_keys;
        job.artifacts.object_bucket = Some(self.deps.bucket.clone());
        Ok(())
    }

    async fn stage_import(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::Import;
        let bucket = job.artifacts.object_bucket.clone().unwrap_or_else(|| self.deps.bucket.clone());
        let mut snapshot_ids = Vec::with_capacity(job.artifacts.object_keys.len());
        for key in job.artifacts.object_keys.clone() {
            let snapshot_id = self.deps.target.import_snapshot(&bucket, &key).await.map_err(|e| collab_err(stage, e))?;
            self.poll_snapshot(&snapshot_id, stage).await?;
            snapshot_ids.push(snapshot_id);
        }
        let boot_snapshot = snapshot_ids.first().cloned().ok_or_else(|| PipelineError::Precondition {
            stage,
            message: "no uploaded objects to import".to_string(),
        })?;
        let extra = snapshot_ids[1..].to_vec();
        let image_id = self.deps.target.create_image(&boot_snapshot, &extra).await.map_err(|e| collab_err(stage, e))?;
        job.artifacts.target_snapshot_ids = snapshot_ids;
        job.artifacts.target_image_id = Some(image_id);
        Ok(())
    }

    async fn poll_snapshot(&self, snapshot_id: &str, stage: Stage) -> PipelineResult<()> {
        let ceiling = Duration::from_secs(1800);
        let interval = Duration::from_secs(15);
        let deadline = tokio::time::Instant::now() + ceiling;
        loop {
            match self.deps.target.snapshot_state(snapshot_id).await.map_err(|e| collab_err(stage, e))? {
                RemoteState::Available => return Ok(()),
                RemoteState::Error => {
                    return Err(PipelineError::Precondition { stage, message: format!("snapshot {snapshot_id} entered error state") })
                }
                RemoteState::Pending => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(PipelineError::Timeout { stage, message: format!("snapshot {snapshot_id} did not become available within {ceiling:?}") });
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    async fn stage_verify(&self, job: &mut VmJob) -> PipelineResult<()> {
        let stage = Stage::Verify;
        if job.artifacts.target_image_id.as_deref().unwrap_or_default().is_empty() {
            return Err(PipelineError::Precondition { stage, message: "target_image_id is empty".to_string() });
        }
        Ok(())
    }

    async fn stage_cleanup(&self, job: &mut VmJob) -> PipelineResult<()> {
        let scratch = self.scratch_dir(job);
        if tokio::fs::remove_dir_all(&scratch).await.is_err() {
            tracing::debug!(path = %scratch.display(), "cleanup: scratch dir already gone");
        }
        if let Some(snapshot_name) = &job.artifacts.snapshot_name {
            if self.deps.source.delete_snapshot(&job.vm_name, snapshot_name).await.is_err() {
                tracing::warn!(vm = %job.vm_name, "cleanup: failed to delete source snapshot");
            }
        }
        if job.artifacts.target_image_id.as_deref().map(|s| !s.is_empty()).unwrap_or(false) {
            let bucket = job.artifacts.object_bucket.clone().unwrap_or_else(|| self.deps.bucket.clone());
            for key in &job.artifacts.object_keys {
                if self.deps.objects.delete(&bucket, key).await.is_err() {
                    tracing::warn!(%key, "cleanup: failed to delete transit object");
                }
            }
        }
        Ok(())
    }

    fn boot_image_path(&self, job: &VmJob, stage: Stage) -> PipelineResult<String> {
        job.artifacts
            .image_paths
            .first()
            .cloned()
            .ok_or_else(|| PipelineError::Precondition { stage, message: "no converted boot image; convert must run first".to_string() })
    }
}

async fn integrity_check(path: &Path) -> Option<bool> {
    let spec = CommandSpec::new("qemu-img", ["check".to_string(), path.display().to_string()]).check(false);
    let out = run(&spec, None).await.ok()?;
    Some(out.success())
}

fn collab_err(stage: Stage, e: CollabError) -> PipelineError {
    PipelineError::Collab { stage, source: e }
}

fn adapter_err(stage: Stage, e: vmw2scw_adapters::AdapterError) -> PipelineError {
    match e {
        vmw2scw_adapters::AdapterError::Tool(t) => PipelineError::Tool { stage, source: t },
        vmw2scw_adapters::AdapterError::Io(io) => PipelineError::Io { stage, source: io },
        vmw2scw_adapters::AdapterError::Integrity(m) => PipelineError::Integrity { stage, message: m },
        vmw2scw_adapters::AdapterError::Timeout(m) => PipelineError::Timeout { stage, message: m },
        vmw2scw_adapters::AdapterError::Precondition(m) => PipelineError::Precondition { stage, message: m },
    }
}

fn io_err(stage: Stage, e: std::io::Error) -> PipelineError {
    PipelineError::Io { stage, source: e }
}

fn now() -> Timestamp {
    Timestamp::now()
}
