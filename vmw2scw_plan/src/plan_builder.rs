//! Builds a persistable [`BatchPlan`] from a raw inventory (§4.3
//! PlanBuilder).

use vmw2scw_catalog::{mapper, TypeCatalog};
use vmw2scw_types::{
    BatchPlan, MigrationEntry, PlanDefaults, PlanMetadata, SizingStrategy, VmRecord, VmSelector,
};

/// Apply the filter (already applied by the caller, §4.2) and the mapper
/// to a raw inventory, emitting a persistable plan document.
///
/// Never mutates `vms`: each VM contributes a fresh [`MigrationEntry`] and,
/// if `auto_map`, a suggested `target_type`.
pub fn build_plan(
    vms: &[VmRecord],
    defaults: PlanDefaults,
    strategy: SizingStrategy,
    auto_map: bool,
    windows_type_override: Option<&str>,
    source_id: &str,
    generated_at: &str,
) -> BatchPlan {
    let catalog = TypeCatalog::new();
    let mut migrations = Vec::with_capacity(vms.len());
    let mut linux_vms = 0u32;
    let mut windows_vms = 0u32;
    let mut total_disk_gb = 0.0;

    for vm in vms {
        let (family, os_label) = vmw2scw_catalog::classify(&vm.guest_os_id);
        let is_windows = family == vmw2scw_types::OsFamily::Windows;
        if is_windows {
            windows_vms += 1;
        } else {
            linux_vms += 1;
        }
        total_disk_gb += vm.total_disk_gb();

        let target_type = if is_windows && windows_type_override.is_some() {
            windows_type_override.map(str::to_string)
        } else if auto_map {
            mapper::suggest(
                &catalog,
                vm.cpu,
                vm.memory_mb,
                vm.total_disk_gb(),
                vm.disks.len() as u32,
                is_windows,
                strategy,
            )
        } else {
            None
        };

        let boot = vm.boot_disk();
        let disk_shape = match boot {
            Some(d) => format!("{} disk(s), boot {:.0}GB on {:?}", vm.disks.len(), d.size_gb, d.controller),
            None => "no disks".to_string(),
        };
        let notes = format!(
            "firmware={:?}; {disk_shape}; os={os_label}",
            vm.firmware
        );

        migrations.push(MigrationEntry {
            selector: VmSelector::Name { vm_name: vm.name.clone() },
            target_type,
            zone: None,
            wave: None,
            priority: 5,
            sizing_strategy: None,
            tags: Vec::new(),
            network_mapping: Default::default(),
            skip_validation: None,
            notes: Some(notes),
        });
    }

    BatchPlan {
        version: 1,
        metadata: PlanMetadata {
            generated_at: generated_at.to_string(),
            source_id: source_id.to_string(),
            total_vms: vms.len() as u32,
            linux_vms,
            windows_vms,
            total_disk_gb,
        },
        defaults,
        concurrency: Default::default(),
        migrations,
        waves: Vec::new(),
        exclude: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmw2scw_types::{Controller, DiskSpec, Firmware, PowerState};

    fn vm(name: &str, windows: bool) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            moref: "vm-1".into(),
            power_state: PowerState::PoweredOn,
            cpu: 2,
            memory_mb: 4096,
            guest_os_id: if windows { "windows11_64Guest".into() } else { "ubuntu64Guest".into() },
            guest_os_full: "".into(),
            firmware: if windows { Firmware::Efi } else { Firmware::Bios },
            disks: vec![DiskSpec {
                size_gb: 40.0,
                thin: true,
                datastore: "ds1".into(),
                file_path: "x".into(),
                controller: Controller::Scsi,
                raw_device_mapping: false,
            }],
            nics: vec![],
            host: "esxi-1".into(),
            cluster: "c1".into(),
            datacenter: "dc1".into(),
            folder: "/dc1/vm".into(),
            tags: vec![],
            tools_status: "toolsOk".into(),
            uuid: "u1".into(),
            snapshots: vec![],
        }
    }

    #[test]
    fn build_plan_aggregates_metadata() {
        let vms = vec![vm("web-01", false), vm("win-01", true)];
        let plan = build_plan(
            &vms,
            PlanDefaults::default(),
            SizingStrategy::Optimize,
            true,
            None,
            "vcenter-1",
            "2026-07-28T00:00:00Z",
        );
        assert_eq!(plan.metadata.total_vms, 2);
        assert_eq!(plan.metadata.linux_vms, 1);
        assert_eq!(plan.metadata.windows_vms, 1);
        assert_eq!(plan.metadata.total_disk_gb, 80.0);
        assert!(plan.migrations[0].target_type.is_some());
    }

    #[test]
    fn build_plan_never_mutates_input() {
        let vms = vec![vm("web-01", false)];
        let before = vms[0].clone();
        let _ = build_plan(&vms, PlanDefaults::default(), SizingStrategy::Optimize, true, None, "s", "t");
        assert_eq!(vms[0], before);
    }

    #[test]
    fn windows_override_wins_over_auto_map() {
        let vms = vec![vm("win-01", true)];
        let plan = build_plan(
            &vms,
            PlanDefaults::default(),
            SizingStrategy::Optimize,
            true,
            Some("POP2-4C-16G-WIN"),
            "s",
            "t",
        );
        assert_eq!(plan.migrations[0].target_type.as_deref(), Some("POP2-4C-16G-WIN"));
    }
}
