// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `vmw2scw`: the operator-facing CLI (§6 "CLI commands") wiring the
//! filter/plan/pipeline/orchestrator crates to real collaborators and a
//! YAML/JSON document layer on disk.

mod config;
mod wiring;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vmw2scw_catalog::TypeCatalog;
use vmw2scw_filter::{InventoryFilter, ResourceRanges};
use vmw2scw_orchestrator::{generate_report, BatchOrchestrator, Budgets};
use vmw2scw_plan::{build_plan, estimate, Estimate, VmShape};
use vmw2scw_state::StateStore;
use vmw2scw_types::{BatchId, BatchPlan, PlanDefaults, SizingStrategy};

use config::Config;

#[derive(Parser)]
#[command(name = "vmw2scw", about = "Batch-migrate VMs from VMware vSphere to Scaleway Instance")]
struct Cli {
    /// Path to the YAML config document (§6 "Config document").
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Filter the source inventory, auto-map target types, and emit a plan.
    InventoryPlan {
        #[arg(long = "filter")]
        filters: Vec<String>,
        #[arg(long, default_value = "plan.yaml")]
        output: PathBuf,
        #[arg(long)]
        no_auto_map: bool,
        #[arg(long, value_enum, default_value = "optimize")]
        strategy: StrategyArg,
        #[arg(long)]
        windows_type: Option<String>,
        #[arg(long, default_value = "fr-par-1")]
        zone: String,
        /// Minimum vCPU count (§4.2 numeric range options).
        #[arg(long)]
        min_cpu: Option<u32>,
        /// Maximum vCPU count.
        #[arg(long)]
        max_cpu: Option<u32>,
        /// Minimum RAM in GB.
        #[arg(long)]
        min_ram: Option<f64>,
        /// Maximum RAM in GB.
        #[arg(long)]
        max_ram: Option<f64>,
        /// Minimum total disk size in GB.
        #[arg(long)]
        min_disk: Option<f64>,
        /// Maximum total disk size in GB.
        #[arg(long)]
        max_disk: Option<f64>,
        /// Maximum number of disks.
        #[arg(long)]
        max_disk_count: Option<usize>,
    },
    /// List VMs matching a filter, without building a plan.
    Inventory {
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    #[command(subcommand)]
    Batch(BatchCommand),
    /// Run the single-VM pipeline for one already-planned migration.
    Migrate {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        vm_name: String,
    },
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Derive a purely informational duration/cost estimate from a plan.
    Estimate {
        #[arg(long)]
        plan: PathBuf,
    },
    /// Drive a plan's VMs through the pipeline to a terminal batch state.
    Run {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Resume a checkpointed batch by id, retrying any failed VMs.
    Resume {
        #[arg(long)]
        batch_id: String,
    },
    /// Print the current status of one batch, or all known batches.
    Status {
        #[arg(long)]
        batch_id: Option<String>,
    },
    /// Regenerate the markdown report for a checkpointed batch.
    Report {
        #[arg(long)]
        batch_id: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StrategyArg {
    Exact,
    Optimize,
    Cost,
}

impl From<StrategyArg> for SizingStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Exact => SizingStrategy::Exact,
            StrategyArg::Optimize => SizingStrategy::Optimize,
            StrategyArg::Cost => SizingStrategy::Cost,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::InventoryPlan {
            filters,
            output,
            no_auto_map,
            strategy,
            windows_type,
            zone,
            min_cpu,
            max_cpu,
            min_ram,
            max_ram,
            min_disk,
            max_disk,
            max_disk_count,
        } => {
            let ranges = ResourceRanges { min_cpu, max_cpu, min_ram_gb: min_ram, max_ram_gb: max_ram, min_disk_gb: min_disk, max_disk_gb: max_disk, max_disk_count };
            inventory_plan(&config, filters, ranges, output, !no_auto_map, strategy.into(), windows_type, zone).await
        }
        Command::Inventory { filters } => inventory(&config, filters).await,
        Command::Migrate { plan, vm_name } => migrate(&config, plan, vm_name).await,
        Command::Batch(BatchCommand::Estimate { plan }) => batch_estimate(plan),
        Command::Batch(BatchCommand::Run { plan, dry_run, yes, report }) => {
            batch_run(&config, plan, dry_run, yes, report).await
        }
        Command::Batch(BatchCommand::Resume { batch_id }) => batch_resume(&config, batch_id).await,
        Command::Batch(BatchCommand::Status { batch_id }) => batch_status(&config, batch_id),
        Command::Batch(BatchCommand::Report { batch_id, output }) => batch_report(&config, batch_id, output),
    }
}

async fn inventory_plan(
    config: &Config,
    filters: Vec<String>,
    ranges: ResourceRanges,
    output: PathBuf,
    auto_map: bool,
    strategy: SizingStrategy,
    windows_type: Option<String>,
    zone: String,
) -> anyhow::Result<ExitCode> {
    let vmware = config.resolve_vmware()?;
    let inventory = wiring::inventory_source(&vmware)?;
    let (filter, warnings) = InventoryFilter::parse_with_ranges(&filters, ranges);
    for warning in &warnings {
        tracing::warn!(%warning, "inventory filter warning");
    }

    let all_vms = vmw2scw_collab::InventorySource::list_vms(&*inventory).await?;
    let matched: Vec<_> = all_vms.into_iter().filter(|vm| filter.matches(vm)).collect();
    tracing::info!(matched = matched.len(), "inventory filtered");

    let defaults = PlanDefaults { zone, sizing_strategy: strategy, ..Default::default() };
    let generated_at = jiff::Timestamp::now().to_string();
    let plan = build_plan(&matched, defaults, strategy, auto_map, windows_type.as_deref(), &vmware.vcenter, &generated_at);

    let yaml = serde_yaml::to_string(&plan)?;
    fs_err::write(&output, yaml)?;
    println!("wrote plan for {} VMs to {}", plan.migrations.len(), output.display());
    Ok(ExitCode::SUCCESS)
}

async fn inventory(config: &Config, filters: Vec<String>) -> anyhow::Result<ExitCode> {
    let vmware = config.resolve_vmware()?;
    let inventory = wiring::inventory_source(&vmware)?;
    let (filter, warnings) = InventoryFilter::parse(&filters);
    for warning in &warnings {
        println!("warning: {warning}");
    }
    let all_vms = vmw2scw_collab::InventorySource::list_vms(&*inventory).await?;
    for vm in all_vms.iter().filter(|vm| filter.matches(vm)) {
        println!("{}\t{:?}\t{} vCPU\t{} MB\t{:.0} GB", vm.name, vm.power_state, vm.cpu, vm.memory_mb, vm.total_disk_gb());
    }
    Ok(ExitCode::SUCCESS)
}

fn batch_estimate(plan_path: PathBuf) -> anyhow::Result<ExitCode> {
    let plan = load_plan(&plan_path)?;
    let catalog = TypeCatalog::new();

    let shapes: Vec<VmShape> = plan
        .migrations
        .iter()
        .map(|m| VmShape {
            is_windows: m.target_type.as_deref().map(|t| t.contains("WIN")).unwrap_or(false),
            disk_gb: plan.metadata.total_disk_gb / (plan.migrations.len().max(1) as f64),
        })
        .collect();
    let target_type_names: Vec<&str> = plan.migrations.iter().filter_map(|m| m.target_type.as_deref()).collect();
    let target_types: Vec<_> = target_type_names.iter().filter_map(|t| catalog.get(t)).collect();

    let estimate: Estimate = estimate(&plan, &shapes, &target_types, None, plan.concurrency.max_total_workers);
    print_estimate(&plan, &estimate);
    Ok(ExitCode::SUCCESS)
}

fn print_estimate(plan: &BatchPlan, estimate: &Estimate) {
    println!("Plan: {} VMs ({} linux, {} windows), {:.0} GB total", plan.metadata.total_vms, plan.metadata.linux_vms, plan.metadata.windows_vms, plan.metadata.total_disk_gb);
    println!("Estimated work space: {:.1} GB", estimate.work_space_gb);
    println!("Estimated duration: {:.1} min (export {:.1}, convert {:.1}, adapt {:.1}, upload {:.1}, import {:.1})",
        estimate.total_minutes, estimate.export_minutes, estimate.convert_minutes, estimate.adaptation_minutes, estimate.upload_minutes, estimate.import_minutes);
    println!("Estimated monthly cost: €{:.2}", estimate.monthly_cost_eur);
    for warning in &estimate.warnings {
        println!("warning: {warning}");
    }
}

async fn batch_run(config: &Config, plan_path: PathBuf, dry_run: bool, yes: bool, report_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let plan = load_plan(&plan_path)?;

    if dry_run {
        let catalog = TypeCatalog::new();
        let shapes: Vec<VmShape> = plan
            .migrations
            .iter()
            .map(|m| VmShape { is_windows: false, disk_gb: plan.metadata.total_disk_gb / (plan.migrations.len().max(1) as f64) })
            .collect();
        let target_types: Vec<_> = plan.migrations.iter().filter_map(|m| m.target_type.as_deref()).filter_map(|t| catalog.get(t)).collect();
        let estimate = estimate(&plan, &shapes, &target_types, None, plan.concurrency.max_total_workers);
        print_estimate(&plan, &estimate);
        println!("dry run: no migration performed");
        return Ok(ExitCode::SUCCESS);
    }

    if !yes {
        anyhow::bail!("refusing to run a live migration without --yes (pass --dry-run to only estimate)");
    }

    let vmware = config.resolve_vmware()?;
    let scaleway = config.resolve_scaleway()?;
    let state = Arc::new(StateStore::open(config.conversion.work_dir.as_path())?);
    let deps = Arc::new(vmw2scw_pipeline::PipelineDeps {
        inventory: wiring::inventory_source(&vmware)?,
        source: Arc::new(vmw2scw_collab::http::HttpSourceSession::new(format!("https://{}/api/v1", vmware.vcenter), vmware.insecure)?),
        target: Arc::new(vmw2scw_collab::http::HttpTargetClient::new(
            "https://api.scaleway.com/instance/v1/zones",
            &scaleway.secret_key,
            scaleway.project_id.clone(),
            scaleway.default_zone.clone(),
        )?),
        objects: Arc::new(vmw2scw_collab::http::S3ObjectStore::new(scaleway.s3_endpoint.clone(), scaleway.access_key.clone(), scaleway.secret_key.clone())?),
        catalog: Arc::new(TypeCatalog::new()),
        state: state.clone(),
        work_dir: config.conversion.work_dir.clone(),
        bucket: scaleway.s3_bucket,
        windows_cfg: vmw2scw_adapters::windows_adapter::WindowsAdapterConfig {
            virtio_win_iso: config.conversion.virtio_win_iso.clone().unwrap_or_else(|| config.conversion.work_dir.join("virtio-win.iso")),
            ovmf_code: config.conversion.ovmf_path.clone().unwrap_or_else(|| "/usr/share/OVMF/OVMF_CODE.fd".into()),
            ovmf_vars_template: config.conversion.work_dir.join("OVMF_VARS.fd"),
            emulator_boot_timeout: vmw2scw_adapters::windows_adapter::WindowsAdapterConfig::default_timeout(),
        },
        cancelled: Arc::new(AtomicBool::new(false)),
        gate: Arc::new(Budgets::new(plan.concurrency)),
    });

    let state_store = deps.state.clone();
    let sink = Arc::new(vmw2scw_collab::NullProgressSink);
    let orchestrator = BatchOrchestrator::new(deps.clone(), state_store, sink);

    let all_vms = vmw2scw_collab::InventorySource::list_vms(&*deps.inventory).await?;
    let state = orchestrator.run_new_batch(&plan, &all_vms).await?;

    let report = generate_report(&state);
    if let Some(path) = report_path {
        fs_err::write(&path, &report)?;
    } else {
        println!("{report}");
    }

    let any_failed = state.jobs.iter().any(|j| j.status == vmw2scw_types::VmStatus::Failed);
    Ok(if any_failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn batch_resume(config: &Config, batch_id: String) -> anyhow::Result<ExitCode> {
    let deps = wiring::build_pipeline_deps(config).await?;
    let state_store = deps.state.clone();
    let sink = Arc::new(vmw2scw_collab::NullProgressSink);
    let orchestrator = BatchOrchestrator::new(deps, state_store, sink);

    let id = BatchId::from_existing(batch_id);
    let state = orchestrator.resume_batch(&id).await?;

    let any_failed = state.jobs.iter().any(|j| j.status == vmw2scw_types::VmStatus::Failed);
    Ok(if any_failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn batch_status(config: &Config, batch_id: Option<String>) -> anyhow::Result<ExitCode> {
    let store = StateStore::open(config.conversion.work_dir.as_path())?;
    let states = match batch_id {
        Some(id) => store.load_batch(&BatchId::from_existing(id.clone()))?.into_iter().collect(),
        None => store.list_batches()?,
    };
    for state in &states {
        let complete = state.jobs.iter().filter(|j| j.status == vmw2scw_types::VmStatus::Complete).count();
        let failed = state.jobs.iter().filter(|j| j.status == vmw2scw_types::VmStatus::Failed).count();
        println!("{}\t{:?}\twave {}/{}\t{}/{} complete\t{} failed", state.batch_id, state.status, state.current_wave, state.total_waves, complete, state.jobs.len(), failed);
    }
    Ok(ExitCode::SUCCESS)
}

fn batch_report(config: &Config, batch_id: String, output: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let store = StateStore::open(config.conversion.work_dir.as_path())?;
    let id = BatchId::from_existing(batch_id.clone());
    let state = store.load_batch(&id)?.ok_or_else(|| anyhow::anyhow!("batch {batch_id} not found"))?;
    let report = generate_report(&state);
    match output {
        Some(path) => fs_err::write(&path, &report)?,
        None => println!("{report}"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn migrate(config: &Config, plan_path: PathBuf, vm_name: String) -> anyhow::Result<ExitCode> {
    let plan = load_plan(&plan_path)?;
    let entry = plan
        .migrations
        .iter()
        .find(|m| m.selector.pattern() == vm_name)
        .ok_or_else(|| anyhow::anyhow!("{vm_name} has no migration entry in {}", plan_path.display()))?;

    let deps = wiring::build_pipeline_deps(config).await?;
    let vm = vmw2scw_collab::InventorySource::get_vm(&*deps.inventory, &vm_name).await?;
    let (os_family, _) = vmw2scw_catalog::classify(&vm.guest_os_id);

    let target_type = entry
        .target_type
        .clone()
        .ok_or_else(|| anyhow::anyhow!("{vm_name} has no target_type and inventory-plan auto-mapping was not run"))?;
    let zone = entry.zone.clone().unwrap_or_else(|| plan.defaults.zone.clone());
    let priority = entry.priority;
    let sizing_strategy = entry.sizing_strategy.unwrap_or(plan.defaults.sizing_strategy);
    let skip_validation = entry.skip_validation.unwrap_or(plan.defaults.skip_validation);

    let mut job = vmw2scw_types::VmJob::new(vm.name.clone(), target_type, zone, vm.host.clone(), vm.firmware, vm.total_disk_gb(), priority, entry.wave.unwrap_or(0), sizing_strategy, skip_validation);
    job.os_family = os_family;
    job.tags = entry.tags.clone();
    job.network_mapping = entry.network_mapping.clone();

    let pipeline = vmw2scw_pipeline::VmPipeline::new(deps);
    pipeline.run(&mut job).await?;

    println!("{}: {:?}", job.vm_name, job.status);
    Ok(if job.status == vmw2scw_types::VmStatus::Failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn load_plan(path: &std::path::Path) -> anyhow::Result<BatchPlan> {
    let raw = fs_err::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}
