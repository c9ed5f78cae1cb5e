//! Expands a persisted [`BatchPlan`] against a live inventory snapshot into
//! runnable [`VmJob`]s, and partitions those jobs into waves (§4.3
//! PlanBuilder data flow continued into §4.8, §3 BatchPlan invariants,
//! §8 Testable Property 8 "Wave grouping").

use std::collections::{BTreeMap, HashSet};

use vmw2scw_types::{BatchPlan, MigrationId, PauseAfter, VmJob, VmRecord, VmSelector};

/// One group of jobs run in parallel and awaited together before the next
/// group starts (§4.8 "Wave loop").
#[derive(Debug, Clone)]
pub struct WaveGroup {
    pub name: String,
    pub job_migration_ids: Vec<MigrationId>,
    pub pause_after: PauseAfter,
}

fn selector_matches(selector: &VmSelector, vm: &VmRecord) -> bool {
    match selector {
        VmSelector::Name { vm_name } => vm_name == &vm.name,
        VmSelector::Pattern { vm_pattern } => glob::Pattern::new(vm_pattern)
            .map(|p| p.matches(&vm.name))
            .unwrap_or(false),
    }
}

fn resolve_selector<'a>(selector: &VmSelector, inventory: &'a [VmRecord]) -> Vec<&'a VmRecord> {
    inventory.iter().filter(|vm| selector_matches(selector, vm)).collect()
}

/// Resolve every `migrations[]` entry against `inventory`, subtract
/// `exclude[]` last, and emit one [`VmJob`] per resolved VM (§3 "every
/// migration resolves to exactly one VMRecord"; "exclusions subtract
/// last"; "a pattern that matches zero VMs is a warning, not an error").
///
/// Never mutates `inventory`.
pub fn expand_plan(plan: &BatchPlan, inventory: &[VmRecord]) -> (Vec<VmJob>, Vec<String>) {
    let mut warnings = Vec::new();

    let mut excluded: HashSet<String> = HashSet::new();
    for entry in &plan.exclude {
        excluded.extend(resolve_selector(&entry.selector, inventory).iter().map(|v| v.name.clone()));
    }

    let mut jobs = Vec::new();
    let mut already_scheduled: HashSet<String> = HashSet::new();

    for entry in &plan.migrations {
        let matched = resolve_selector(&entry.selector, inventory);
        if matched.is_empty() {
            warnings.push(format!(
                "migration selector `{}` matched no VMs in the inventory",
                entry.selector.pattern()
            ));
            continue;
        }

        for vm in matched {
            if excluded.contains(&vm.name) {
                continue;
            }
            if !already_scheduled.insert(vm.name.clone()) {
                continue;
            }

            let target_type = entry.target_type.clone().unwrap_or_default();
            let zone = entry.zone.clone().unwrap_or_else(|| plan.defaults.zone.clone());
            let sizing_strategy = entry.sizing_strategy.unwrap_or(plan.defaults.sizing_strategy);
            let skip_validation = entry.skip_validation.unwrap_or(plan.defaults.skip_validation);

            let mut tags = plan.defaults.tags.clone();
            tags.extend(entry.tags.iter().cloned());
            let mut network_mapping = plan.defaults.network_mapping.clone();
            network_mapping.extend(entry.network_mapping.clone());

            let mut job = VmJob::new(
                vm.name.clone(),
                target_type,
                zone,
                vm.host.clone(),
                vm.firmware,
                vm.total_disk_gb(),
                entry.priority,
                entry.wave.unwrap_or(0),
                sizing_strategy,
                skip_validation,
            );
            job.tags = tags;
            job.network_mapping = network_mapping;
            jobs.push(job);
        }
    }

    (jobs, warnings)
}

/// Partition `jobs` into ordered [`WaveGroup`]s per the plan's `waves[]`
/// declaration, or derive waves from `priority` if none are declared
/// (§3, §8 Testable Property 8).
///
/// Also overwrites each job's `wave` field with its resolved wave index,
/// so a reloaded [`vmw2scw_types::BatchState`] (which has no access to the
/// original plan) can still be regrouped into waves on resume via
/// [`waves_from_jobs`].
pub fn partition_waves(plan: &BatchPlan, jobs: &mut [VmJob]) -> Vec<WaveGroup> {
    if !plan.waves.is_empty() {
        let mut groups = Vec::with_capacity(plan.waves.len());
        for (index, wave_spec) in plan.waves.iter().enumerate() {
            let ids: Vec<MigrationId> = match &wave_spec.vms {
                Some(names) => jobs
                    .iter_mut()
                    .filter(|j| names.contains(&j.vm_name))
                    .map(|j| {
                        j.wave = index as u32;
                        j.migration_id.clone()
                    })
                    .collect(),
                // No explicit VM list: fall back to the migration entry's
                // declared `wave` number matching this wave's position.
                None => jobs
                    .iter_mut()
                    .filter(|j| j.wave == index as u32)
                    .map(|j| j.migration_id.clone())
                    .collect(),
            };
            groups.push(WaveGroup {
                name: wave_spec.name.clone(),
                job_migration_ids: ids,
                pause_after: wave_spec.pause_after,
            });
        }
        return groups;
    }

    // Implicit waves: one per distinct priority, ascending (§3, §8 Property 8).
    let mut by_priority: BTreeMap<u8, Vec<MigrationId>> = BTreeMap::new();
    for job in jobs.iter() {
        by_priority.entry(job.priority).or_default().push(job.migration_id.clone());
    }
    let mut groups = Vec::with_capacity(by_priority.len());
    for (index, (priority, ids)) in by_priority.into_iter().enumerate() {
        for job in jobs.iter_mut() {
            if ids.contains(&job.migration_id) {
                job.wave = index as u32;
            }
        }
        groups.push(WaveGroup {
            name: format!("priority-{priority}"),
            job_migration_ids: ids,
            pause_after: PauseAfter::Continue,
        });
    }
    groups
}

/// Rebuild wave groups purely from the `wave` field already recorded on
/// each job — used on [`crate::BatchOrchestrator::resume_batch`], where
/// only the persisted [`vmw2scw_types::BatchState`] is available, not the
/// original plan. `pause_after` is not persisted per-job, so resumed waves
/// always default to `continue`.
pub fn waves_from_jobs(jobs: &[VmJob]) -> Vec<WaveGroup> {
    let mut by_wave: BTreeMap<u32, Vec<MigrationId>> = BTreeMap::new();
    for job in jobs {
        by_wave.entry(job.wave).or_default().push(job.migration_id.clone());
    }
    by_wave
        .into_iter()
        .map(|(wave, ids)| WaveGroup {
            name: format!("wave-{wave}"),
            job_migration_ids: ids,
            pause_after: PauseAfter::Continue,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmw2scw_types::{Controller, DiskSpec, ExcludeEntry, Firmware, MigrationEntry, PlanDefaults, PlanMetadata, PowerState, SizingStrategy, WaveSpec};

    fn vm(name: &str) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            moref: "vm-1".into(),
            power_state: PowerState::PoweredOn,
            cpu: 2,
            memory_mb: 4096,
            guest_os_id: "ubuntu64Guest".into(),
            guest_os_full: "".into(),
            firmware: Firmware::Bios,
            disks: vec![DiskSpec {
                size_gb: 10.0,
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
            uuid: format!("u-{name}"),
            snapshots: vec![],
        }
    }

    fn entry(selector: VmSelector, priority: u8) -> MigrationEntry {
        MigrationEntry {
            selector,
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

    fn base_plan() -> BatchPlan {
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
            concurrency: Default::default(),
            migrations: vec![],
            waves: vec![],
            exclude: vec![],
        }
    }

    #[test]
    fn exclusion_and_pattern_resolve_expected_set() {
        // §8 Scenario S6.
        let inventory = vec![vm("web-01"), vm("web-02"), vm("db-01"), vm("template-ubuntu")];
        let mut plan = base_plan();
        plan.migrations = vec![
            entry(VmSelector::Pattern { vm_pattern: "web-*".into() }, 5),
            entry(VmSelector::Pattern { vm_pattern: "db-*".into() }, 5),
        ];
        plan.exclude = vec![ExcludeEntry { selector: VmSelector::Pattern { vm_pattern: "template-*".into() } }];

        let (jobs, warnings) = expand_plan(&plan, &inventory);
        assert!(warnings.is_empty());
        let mut names: Vec<_> = jobs.iter().map(|j| j.vm_name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["db-01", "web-01", "web-02"]);
    }

    #[test]
    fn zero_match_pattern_is_a_warning_not_an_error() {
        let inventory = vec![vm("web-01")];
        let mut plan = base_plan();
        plan.migrations = vec![entry(VmSelector::Pattern { vm_pattern: "ghost-*".into() }, 5)];
        let (jobs, warnings) = expand_plan(&plan, &inventory);
        assert!(jobs.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn implicit_waves_group_by_ascending_priority() {
        // §8 Testable Property 8: priorities {1,1,2,5,5} -> [[1,1],[2],[5,5]].
        let inventory: Vec<VmRecord> = (0..5).map(|i| vm(&format!("vm-{i}"))).collect();
        let mut plan = base_plan();
        plan.migrations = vec![
            entry(VmSelector::Name { vm_name: "vm-0".into() }, 1),
            entry(VmSelector::Name { vm_name: "vm-1".into() }, 1),
            entry(VmSelector::Name { vm_name: "vm-2".into() }, 2),
            entry(VmSelector::Name { vm_name: "vm-3".into() }, 5),
            entry(VmSelector::Name { vm_name: "vm-4".into() }, 5),
        ];
        let (mut jobs, _) = expand_plan(&plan, &inventory);
        let waves = partition_waves(&plan, &mut jobs);
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].job_migration_ids.len(), 2);
        assert_eq!(waves[1].job_migration_ids.len(), 1);
        assert_eq!(waves[2].job_migration_ids.len(), 2);
    }

    #[test]
    fn explicit_waves_override_priority_derived_waves() {
        let inventory = vec![vm("a"), vm("b")];
        let mut plan = base_plan();
        plan.migrations = vec![
            entry(VmSelector::Name { vm_name: "a".into() }, 1),
            entry(VmSelector::Name { vm_name: "b".into() }, 9),
        ];
        plan.waves = vec![WaveSpec {
            name: "everyone-at-once".into(),
            vms: Some(vec!["a".into(), "b".into()]),
            pause_after: PauseAfter::Continue,
        }];
        let (mut jobs, _) = expand_plan(&plan, &inventory);
        let waves = partition_waves(&plan, &mut jobs);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].job_migration_ids.len(), 2);
    }

    #[test]
    fn waves_from_jobs_regroups_by_persisted_wave_field() {
        let inventory = vec![vm("a"), vm("b"), vm("c")];
        let mut plan = base_plan();
        plan.migrations = vec![
            entry(VmSelector::Name { vm_name: "a".into() }, 1),
            entry(VmSelector::Name { vm_name: "b".into() }, 1),
            entry(VmSelector::Name { vm_name: "c".into() }, 2),
        ];
        let (mut jobs, _) = expand_plan(&plan, &inventory);
        let _ = partition_waves(&plan, &mut jobs);
        let waves = waves_from_jobs(&jobs);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].job_migration_ids.len(), 2);
        assert_eq!(waves[1].job_migration_ids.len(), 1);
    }
}
