//! Target instance type catalog entries (§3 InstanceTypeSpec).

use serde::{Deserialize, Serialize};

/// Broad pricing/performance category of a target instance type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Development,
    General,
    Compute,
    Memory,
    Gpu,
}

/// A target instance shape: vCPU/RAM/volume limits, pricing, OS eligibility.
///
/// Frozen at program start; [`vmw2scw_catalog::TypeCatalog`] looks these up
/// by name in O(1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTypeSpec {
    pub name: String,
    pub vcpus: u32,
    pub ram_gb: f64,
    pub category: Category,
    pub shared_vcpu: bool,
    pub windows: bool,
    pub block_storage: bool,
    pub local_storage_gb: f64,
    pub max_volumes: u32,
    pub max_volume_size_gb: u32,
    pub price_hour: f64,
}
