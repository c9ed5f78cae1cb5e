//! The compiled-in target instance type catalog (§4.1 TypeCatalog).
//!
//! Contents are compiled into the binary, mirroring the source's
//! `scaleway/mapping.py::INSTANCE_TYPES` table (Scaleway pricing page,
//! February 2026 snapshot) verbatim.

use vmw2scw_types::{Category, InstanceTypeSpec};

macro_rules! spec {
    ($name:literal, $vcpus:expr, $ram_gb:expr, $category:ident, $price:expr, $block_storage:expr,
     $local_storage_gb:expr, $max_volumes:expr, $max_volume_size_gb:expr $(, shared_vcpu = $shared:expr)? $(, windows = $windows:expr)?) => {
        InstanceTypeSpec {
            name: $name.to_string(),
            vcpus: $vcpus,
            ram_gb: $ram_gb,
            category: Category::$category,
            shared_vcpu: false $(|| $shared)?,
            windows: false $(|| $windows)?,
            block_storage: $block_storage,
            local_storage_gb: $local_storage_gb,
            max_volumes: $max_volumes,
            max_volume_size_gb: $max_volume_size_gb,
            price_hour: $price,
        }
    };
}

/// The full compiled-in catalog, in declaration order (PLAY2 development
/// tier, PRO2 general purpose, POP2 compute, POP2 high-memory, POP2/-HM
/// Windows variants).
pub fn all_instance_types() -> Vec<InstanceTypeSpec> {
    vec![
        // PLAY2 (development / shared vCPU)
        spec!("PLAY2-NANO", 1, 1.0, Development, 0.0070, true, 0.0, 1, 400, shared_vcpu = true),
        spec!("PLAY2-MICRO", 2, 2.0, Development, 0.0140, true, 0.0, 2, 400, shared_vcpu = true),
        spec!("PLAY2-SMALL", 2, 4.0, Development, 0.0280, true, 0.0, 4, 400, shared_vcpu = true),
        spec!("PLAY2-MEDIUM", 4, 8.0, Development, 0.0560, true, 0.0, 4, 400, shared_vcpu = true),
        // PRO2 (general purpose)
        spec!("PRO2-XXS", 2, 8.0, General, 0.0660, true, 0.0, 16, 10000),
        spec!("PRO2-XS", 4, 16.0, General, 0.1320, true, 0.0, 16, 10000),
        spec!("PRO2-S", 8, 32.0, General, 0.2640, true, 0.0, 16, 10000),
        spec!("PRO2-M", 16, 64.0, General, 0.5280, true, 0.0, 16, 10000),
        spec!("PRO2-L", 32, 128.0, General, 1.0560, true, 0.0, 16, 10000),
        // POP2 (performance / local NVMe)
        spec!("POP2-2C-8G", 2, 8.0, Compute, 0.0770, true, 50.0, 16, 10000),
        spec!("POP2-4C-16G", 4, 16.0, Compute, 0.1540, true, 100.0, 16, 10000),
        spec!("POP2-8C-32G", 8, 32.0, Compute, 0.3080, true, 200.0, 16, 10000),
        spec!("POP2-16C-64G", 16, 64.0, Compute, 0.6160, true, 400.0, 16, 10000),
        spec!("POP2-32C-128G", 32, 128.0, Compute, 1.2320, true, 800.0, 16, 10000),
        // POP2 high-memory
        spec!("POP2-HM-2C-16G", 2, 16.0, Memory, 0.0990, true, 50.0, 16, 10000),
        spec!("POP2-HM-4C-32G", 4, 32.0, Memory, 0.1980, true, 100.0, 16, 10000),
        spec!("POP2-HM-8C-64G", 8, 64.0, Memory, 0.3960, true, 200.0, 16, 10000),
        spec!("POP2-HM-16C-128G", 16, 128.0, Memory, 0.7920, true, 400.0, 16, 10000),
        spec!("POP2-HM-32C-256G", 32, 256.0, Memory, 1.5840, true, 800.0, 16, 10000),
        spec!("POP2-HM-64C-512G", 64, 512.0, Memory, 3.1680, true, 1600.0, 16, 10000),
        // POP2 Windows
        spec!("POP2-4C-16G-WIN", 4, 16.0, Compute, 0.2200, true, 100.0, 16, 10000, windows = true),
        spec!("POP2-8C-32G-WIN", 8, 32.0, Compute, 0.4400, true, 200.0, 16, 10000, windows = true),
        spec!("POP2-16C-64G-WIN", 16, 64.0, Compute, 0.8800, true, 400.0, 16, 10000, windows = true),
        spec!("POP2-32C-128G-WIN", 32, 128.0, Compute, 1.7600, true, 800.0, 16, 10000, windows = true),
        // POP2-HM Windows
        spec!("POP2-HM-4C-32G-WIN", 4, 32.0, Memory, 0.2860, true, 100.0, 16, 10000, windows = true),
        spec!("POP2-HM-8C-64G-WIN", 8, 64.0, Memory, 0.5720, true, 200.0, 16, 10000, windows = true),
        spec!("POP2-HM-16C-128G-WIN", 16, 128.0, Memory, 1.1440, true, 400.0, 16, 10000, windows = true),
    ]
}

/// Static catalog of target instance shapes. Lookup is O(1) by name.
pub struct TypeCatalog {
    by_name: std::collections::HashMap<String, InstanceTypeSpec>,
}

impl TypeCatalog {
    /// Build the catalog from the compiled-in instance type table.
    pub fn new() -> Self {
        Self::from_specs(all_instance_types())
    }

    /// Build a catalog from an explicit set of specs (used by tests to
    /// exercise the mapper against a small fixture catalog).
    pub fn from_specs(specs: Vec<InstanceTypeSpec>) -> Self {
        Self {
            by_name: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&InstanceTypeSpec> {
        self.by_name.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &InstanceTypeSpec> {
        self.by_name.values()
    }
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_is_exact() {
        let catalog = TypeCatalog::new();
        assert_eq!(catalog.get("PRO2-XXS").unwrap().vcpus, 2);
        assert!(catalog.get("NOT-A-TYPE").is_none());
    }

    #[test]
    fn windows_types_are_flagged() {
        let catalog = TypeCatalog::new();
        assert!(catalog.get("POP2-4C-16G-WIN").unwrap().windows);
        assert!(!catalog.get("POP2-4C-16G").unwrap().windows);
    }
}
