//! Derives a duration / work-space / cost estimate from a plan (§4.3
//! Estimator). Purely informational: never gates execution.

use vmw2scw_types::{BatchPlan, InstanceTypeSpec};

/// A resolved, per-VM resource shape used to drive the time model. The
/// estimator only needs disk size and OS family; it doesn't need a full
/// inventory lookup, so callers may pass a lightweight summary built from
/// the plan alone when the live inventory isn't at hand.
#[derive(Debug, Clone, Copy)]
pub struct VmShape {
    pub is_windows: bool,
    pub disk_gb: f64,
}

/// Output of [`estimate`].
#[derive(Debug, Clone, Default)]
pub struct Estimate {
    pub work_space_gb: f64,
    pub export_minutes: f64,
    pub convert_minutes: f64,
    pub adaptation_minutes: f64,
    pub upload_minutes: f64,
    pub import_minutes: f64,
    pub total_minutes: f64,
    pub monthly_cost_eur: f64,
    pub warnings: Vec<String>,
}

const MIB_PER_GB: f64 = 1024.0;

/// Derive duration / work-space / monthly-cost / warnings from a plan plus
/// an available-disk hint and a concurrency hint (§4.3).
pub fn estimate(
    plan: &BatchPlan,
    vm_shapes: &[VmShape],
    target_types: &[&InstanceTypeSpec],
    avail_disk_gb: Option<f64>,
    concurrency: u32,
) -> Estimate {
    let total_disk_gb = plan.metadata.total_disk_gb;
    let work_space_gb = 1.5 * total_disk_gb;

    let export_minutes = total_disk_gb * MIB_PER_GB / (100.0 * 60.0);
    let convert_minutes = total_disk_gb * MIB_PER_GB / (200.0 * 60.0);
    let upload_minutes = total_disk_gb * MIB_PER_GB / (500.0 * 60.0);

    let linux_count = vm_shapes.iter().filter(|s| !s.is_windows).count() as f64;
    let windows_count = vm_shapes.iter().filter(|s| s.is_windows).count() as f64;
    let adaptation_minutes = linux_count * 0.5 + windows_count * 7.0;
    let import_minutes = vm_shapes.len() as f64 * 3.0;

    let sum = export_minutes + convert_minutes + adaptation_minutes + upload_minutes + import_minutes;
    let total_minutes = sum / (concurrency.max(1) as f64) * 1.3;

    let monthly_cost_eur: f64 = target_types.iter().map(|t| t.price_hour * 24.0 * 30.0).sum();

    let mut warnings = Vec::new();
    if let Some(avail) = avail_disk_gb {
        if work_space_gb > avail {
            warnings.push(format!(
                "required work space {work_space_gb:.0}GB exceeds available disk {avail:.0}GB"
            ));
        }
    }
    if vm_shapes.iter().any(|s| s.is_windows) {
        warnings.push("batch includes Windows VMs: a KVM-capable host is required for the guest-boot phase".to_string());
    }
    if vm_shapes.len() > 20 && concurrency < 5 {
        warnings.push(format!(
            "{} VMs with concurrency {concurrency} < 5 will run slowly; consider raising max_total_workers",
            vm_shapes.len()
        ));
    }

    Estimate {
        work_space_gb,
        export_minutes,
        convert_minutes,
        adaptation_minutes,
        upload_minutes,
        import_minutes,
        total_minutes,
        monthly_cost_eur,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmw2scw_types::{PlanDefaults, PlanMetadata};

    fn plan_with_disk(total_disk_gb: f64) -> BatchPlan {
        BatchPlan {
            version: 1,
            metadata: PlanMetadata {
                generated_at: "t".into(),
                source_id: "s".into(),
                total_vms: 1,
                linux_vms: 1,
                windows_vms: 0,
                total_disk_gb,
            },
            defaults: PlanDefaults::default(),
            concurrency: Default::default(),
            migrations: vec![],
            waves: vec![],
            exclude: vec![],
        }
    }

    #[test]
    fn work_space_is_one_point_five_times_disk() {
        let plan = plan_with_disk(100.0);
        let est = estimate(&plan, &[], &[], None, 5);
        assert_eq!(est.work_space_gb, 150.0);
    }

    #[test]
    fn windows_vm_triggers_kvm_warning() {
        let plan = plan_with_disk(40.0);
        let shapes = vec![VmShape { is_windows: true, disk_gb: 40.0 }];
        let est = estimate(&plan, &shapes, &[], None, 5);
        assert!(est.warnings.iter().any(|w| w.contains("KVM-capable")));
    }

    #[test]
    fn insufficient_disk_warns() {
        let plan = plan_with_disk(1000.0);
        let est = estimate(&plan, &[], &[], Some(100.0), 5);
        assert!(est.warnings.iter().any(|w| w.contains("exceeds available disk")));
    }

    #[test]
    fn low_concurrency_large_batch_warns() {
        let plan = plan_with_disk(100.0);
        let shapes: Vec<VmShape> = (0..25).map(|_| VmShape { is_windows: false, disk_gb: 4.0 }).collect();
        let est = estimate(&plan, &shapes, &[], None, 2);
        assert!(est.warnings.iter().any(|w| w.contains("consider raising")));
    }
}
