//! Resource-to-instance-type mapping and validation (§4.1 Mapper).

use vmw2scw_types::{Category, SizingStrategy};

use crate::catalog::TypeCatalog;

/// Suggest the single best-scoring target instance type for the given
/// resource profile, or `None` if nothing in the catalog fits (§4.1
/// Mapper.suggest).
pub fn suggest(
    catalog: &TypeCatalog,
    cpu: u32,
    ram_mb: u64,
    disk_gb: f64,
    disk_count: u32,
    is_windows: bool,
    strategy: SizingStrategy,
) -> Option<String> {
    let ram_gb = ram_mb as f64 / 1024.0;

    let mut candidates: Vec<(f64, &str)> = catalog
        .all()
        .filter(|spec| is_eligible(spec, cpu, ram_gb, disk_gb, disk_count, is_windows, strategy))
        .map(|spec| (score(spec, cpu, ram_gb, strategy), spec.name.as_str()))
        .collect();

    // Tie-break by lexicographic name: sort by (score, name).
    candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then_with(|| a.1.cmp(b.1)));
    candidates.first().map(|(_, name)| name.to_string())
}

fn is_eligible(
    spec: &vmw2scw_types::InstanceTypeSpec,
    cpu: u32,
    ram_gb: f64,
    disk_gb: f64,
    disk_count: u32,
    is_windows: bool,
    strategy: SizingStrategy,
) -> bool {
    if spec.windows != is_windows {
        return false;
    }
    if spec.category == Category::Development && strategy != SizingStrategy::Cost {
        return false;
    }
    if (spec.vcpus as f64) < cpu as f64 {
        return false;
    }
    if spec.ram_gb < ram_gb {
        return false;
    }
    if spec.max_volumes < disk_count {
        return false;
    }
    if !spec.block_storage && spec.local_storage_gb < disk_gb {
        return false;
    }
    true
}

fn score(
    spec: &vmw2scw_types::InstanceTypeSpec,
    cpu: u32,
    ram_gb: f64,
    strategy: SizingStrategy,
) -> f64 {
    let cw = (spec.vcpus as f64 - cpu as f64) / spec.vcpus as f64;
    let rw = (spec.ram_gb - ram_gb) / spec.ram_gb;
    match strategy {
        SizingStrategy::Cost => spec.price_hour,
        SizingStrategy::Exact => cw + rw,
        SizingStrategy::Optimize => {
            let mut s = 0.6 * cw + 0.4 * rw;
            if !spec.shared_vcpu {
                s -= 0.05;
            }
            if spec.category == Category::Memory && cpu > 0 && ram_gb / cpu as f64 > 6.0 {
                s -= 0.03;
            }
            s
        }
    }
}

/// Validate that `target_type` can actually run a VM with the given
/// resource profile, returning human-readable reasons it can't (§4.1
/// Mapper.validate). Empty ⇒ valid.
pub fn validate(
    catalog: &TypeCatalog,
    target_type: &str,
    cpu: u32,
    ram_mb: u64,
    disk_gb: f64,
    disk_count: u32,
    is_windows: bool,
) -> Vec<String> {
    let Some(spec) = catalog.get(target_type) else {
        return vec![format!("Unknown instance type: {target_type}")];
    };

    let mut issues = Vec::new();
    let ram_gb = ram_mb as f64 / 1024.0;

    if (spec.vcpus as f64) < cpu as f64 {
        issues.push(format!("Insufficient vCPUs: {} < {cpu}", spec.vcpus));
    }
    if spec.ram_gb < ram_gb {
        issues.push(format!("Insufficient RAM: {}GB < {ram_gb:.1}GB", spec.ram_gb));
    }
    if disk_count > spec.max_volumes {
        issues.push(format!(
            "Too many disks: {disk_count} > {} max volumes",
            spec.max_volumes
        ));
    }
    if is_windows && !spec.windows {
        issues.push(format!("{target_type} is not a Windows-compatible type"));
    }
    if !is_windows && spec.windows {
        issues.push(format!("{target_type} is Windows-only; use non-WIN variant"));
    }
    let _ = disk_gb; // reserved: local-storage fit is enforced at suggest() time, not re-checked here.
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggest_fits_small_linux_vm() {
        let catalog = TypeCatalog::new();
        let t = suggest(&catalog, 2, 4096, 40.0, 1, false, SizingStrategy::Optimize).unwrap();
        let issues = validate(&catalog, &t, 2, 4096, 40.0, 1, false);
        assert!(issues.is_empty(), "issues: {issues:?}");
    }

    #[test]
    fn suggest_none_for_oversized_profile() {
        let catalog = TypeCatalog::new();
        let t = suggest(&catalog, 999, 999 * 1024, 100.0, 1, false, SizingStrategy::Optimize);
        assert!(t.is_none());
    }

    #[test]
    fn cost_strategy_allows_development_category() {
        let catalog = TypeCatalog::new();
        let t = suggest(&catalog, 1, 512, 5.0, 1, false, SizingStrategy::Cost).unwrap();
        assert_eq!(t, "PLAY2-NANO");
    }

    #[test]
    fn windows_flag_must_match() {
        let catalog = TypeCatalog::new();
        let t = suggest(&catalog, 4, 16384, 100.0, 1, true, SizingStrategy::Optimize).unwrap();
        assert!(catalog.get(&t).unwrap().windows);
    }

    #[test]
    fn validate_rejects_windows_mismatch() {
        let catalog = TypeCatalog::new();
        let issues = validate(&catalog, "PRO2-XXS", 2, 4096, 40.0, 1, true);
        assert!(issues.iter().any(|i| i.contains("Windows-compatible")));
    }

    #[test]
    fn validate_rejects_unknown_type() {
        let catalog = TypeCatalog::new();
        let issues = validate(&catalog, "NOPE", 1, 1024, 10.0, 1, false);
        assert_eq!(issues, vec!["Unknown instance type: NOPE"]);
    }
}
