//! Assembles the real (non-fake) collaborators named in §6 from a
//! resolved [`Config`] and hands back a ready-to-use [`PipelineDeps`].

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use vmw2scw_catalog::TypeCatalog;
use vmw2scw_collab::http::{HttpInventory, HttpSourceSession, HttpTargetClient, S3ObjectStore};
use vmw2scw_pipeline::{NoopGate, PipelineDeps};
use vmw2scw_state::StateStore;

use crate::config::{Config, ResolvedVmware};

/// Build an [`InventorySource`](vmw2scw_collab::InventorySource) talking to
/// the vCenter-fronting inventory service named in the config.
pub fn inventory_source(vmware: &ResolvedVmware) -> anyhow::Result<Arc<dyn vmw2scw_collab::InventorySource>> {
    Ok(Arc::new(HttpInventory::new(format!("https://{}/api/v1", vmware.vcenter), vmware.insecure)?))
}

/// Build the full set of collaborators plus a [`NoopGate`]-gated,
/// not-yet-cancelled [`PipelineDeps`]. Callers that need layered
/// concurrency budgets (batch commands) replace `gate`; callers that need
/// cooperative cancellation wired to an external signal replace
/// `cancelled`.
pub async fn build_pipeline_deps(config: &Config) -> anyhow::Result<Arc<PipelineDeps>> {
    let vmware = config.resolve_vmware()?;
    let scaleway = config.resolve_scaleway()?;

    let inventory = inventory_source(&vmware)?;
    let source: Arc<dyn vmw2scw_collab::SourceSession> =
        Arc::new(HttpSourceSession::new(format!("https://{}/api/v1", vmware.vcenter), vmware.insecure)?);
    let target: Arc<dyn vmw2scw_collab::TargetClient> = Arc::new(HttpTargetClient::new(
        "https://api.scaleway.com/instance/v1/zones",
        &scaleway.secret_key,
        scaleway.project_id.clone(),
        scaleway.default_zone.clone(),
    )?);
    let objects: Arc<dyn vmw2scw_collab::ObjectStore> =
        Arc::new(S3ObjectStore::new(scaleway.s3_endpoint.clone(), scaleway.access_key.clone(), scaleway.secret_key.clone())?);

    let state = Arc::new(StateStore::open(config.conversion.work_dir.as_path())?);
    let windows_cfg = vmw2scw_adapters::windows_adapter::WindowsAdapterConfig {
        virtio_win_iso: config.conversion.virtio_win_iso.clone().unwrap_or_else(|| config.conversion.work_dir.join("virtio-win.iso")),
        ovmf_code: config.conversion.ovmf_path.clone().unwrap_or_else(|| "/usr/share/OVMF/OVMF_CODE.fd".into()),
        ovmf_vars_template: config.conversion.work_dir.join("OVMF_VARS.fd"),
        emulator_boot_timeout: vmw2scw_adapters::windows_adapter::WindowsAdapterConfig::default_timeout(),
    };

    Ok(Arc::new(PipelineDeps {
        inventory,
        source,
        target,
        objects,
        catalog: Arc::new(TypeCatalog::new()),
        state,
        work_dir: config.conversion.work_dir.clone(),
        bucket: scaleway.s3_bucket,
        windows_cfg,
        cancelled: Arc::new(AtomicBool::new(false)),
        gate: Arc::new(NoopGate),
    }))
}
