// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Evaluates a VM record against a conjunction of operator-supplied
//! predicates (§4.2 InventoryFilter).
//!
//! Predicates are parsed from `key:value` strings (a bare string defaults
//! to the `name` key). Across different keys, predicates conjoin (AND);
//! within one key, repeated predicates are a disjunction (OR). Unknown
//! keys produce a warning and are otherwise ignored. Numeric range
//! options (min/max CPU, RAM, disk, disk count) conjoin with the
//! `key:value` predicates and with each other.

use std::collections::HashMap;

use regex::Regex;
use vmw2scw_types::{Firmware, OsFamily, PowerState, VmRecord};

const KNOWN_KEYS: &[&str] = &[
    "name", "regex", "folder", "os", "os_id", "tag", "host", "cluster", "dc", "state", "firmware",
];

/// Numeric range options layered on top of the `key:value` predicates
/// (§2, §4.2 "plus numeric range options").
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceRanges {
    pub min_cpu: Option<u32>,
    pub max_cpu: Option<u32>,
    pub min_ram_gb: Option<f64>,
    pub max_ram_gb: Option<f64>,
    pub min_disk_gb: Option<f64>,
    pub max_disk_gb: Option<f64>,
    pub max_disk_count: Option<usize>,
}

/// A parsed, ready-to-evaluate inventory filter.
#[derive(Debug, Default)]
pub struct InventoryFilter {
    predicates: HashMap<String, Vec<String>>,
    ranges: ResourceRanges,
}

impl InventoryFilter {
    /// Parse a list of operator-supplied predicate strings into a filter.
    ///
    /// Returns the filter plus a list of human-readable warnings (unknown
    /// keys). This never fails outright: an unrecognized key is dropped,
    /// not treated as a fatal error, matching §4.2's stated semantics.
    pub fn parse(raw: &[String]) -> (Self, Vec<String>) {
        Self::parse_with_ranges(raw, ResourceRanges::default())
    }

    /// Parse `key:value` predicate strings alongside numeric range
    /// options supplied separately (e.g. from dedicated CLI flags).
    pub fn parse_with_ranges(raw: &[String], ranges: ResourceRanges) -> (Self, Vec<String>) {
        let mut predicates: HashMap<String, Vec<String>> = HashMap::new();
        let mut warnings = Vec::new();

        for entry in raw {
            let (key, value) = match entry.split_once(':') {
                Some((k, v)) => (k, v),
                None => ("name", entry.as_str()),
            };
            if !KNOWN_KEYS.contains(&key) {
                warnings.push(format!("unknown filter key `{key}`, ignoring predicate `{entry}`"));
                continue;
            }
            predicates.entry(key.to_string()).or_default().push(value.to_string());
        }

        (Self { predicates, ranges }, warnings)
    }

    /// Build a filter directly from already-grouped predicates (used by
    /// tests and by callers composing a filter programmatically rather
    /// than from CLI strings).
    pub fn from_predicates(predicates: HashMap<String, Vec<String>>) -> Self {
        Self { predicates, ranges: ResourceRanges::default() }
    }

    /// Attach numeric range options to an already-built filter.
    pub fn with_ranges(mut self, ranges: ResourceRanges) -> Self {
        self.ranges = ranges;
        self
    }

    /// Evaluate the filter against `vm`. Pure and side-effect free (§4.2).
    pub fn matches(&self, vm: &VmRecord) -> bool {
        self.predicates.iter().all(|(key, values)| values.iter().any(|value| matches_one(key, value, vm)))
            && matches_ranges(&self.ranges, vm)
    }
}

fn matches_ranges(ranges: &ResourceRanges, vm: &VmRecord) -> bool {
    let ram_gb = vm.memory_mb as f64 / 1024.0;
    let disk_gb = vm.total_disk_gb();

    if let Some(min_cpu) = ranges.min_cpu {
        if vm.cpu < min_cpu {
            return false;
        }
    }
    if let Some(max_cpu) = ranges.max_cpu {
        if vm.cpu > max_cpu {
            return false;
        }
    }
    if let Some(min_ram_gb) = ranges.min_ram_gb {
        if ram_gb < min_ram_gb {
            return false;
        }
    }
    if let Some(max_ram_gb) = ranges.max_ram_gb {
        if ram_gb > max_ram_gb {
            return false;
        }
    }
    if let Some(min_disk_gb) = ranges.min_disk_gb {
        if disk_gb < min_disk_gb {
            return false;
        }
    }
    if let Some(max_disk_gb) = ranges.max_disk_gb {
        if disk_gb > max_disk_gb {
            return false;
        }
    }
    if let Some(max_disk_count) = ranges.max_disk_count {
        if vm.disks.len() > max_disk_count {
            return false;
        }
    }
    true
}

fn matches_one(key: &str, value: &str, vm: &VmRecord) -> bool {
    match key {
        "name" => glob_match(value, &vm.name),
        "regex" => Regex::new(value).map(|re| re.is_match(&vm.name)).unwrap_or(false),
        "folder" => vm.folder.starts_with(value),
        "os" => {
            let (family, _) = vmw2scw_catalog::classify(&vm.guest_os_id);
            match value {
                "linux" => family == OsFamily::Linux,
                "windows" => family == OsFamily::Windows,
                _ => false,
            }
        }
        "os_id" => glob_match(value, &vm.guest_os_id),
        "tag" => vm.tags.iter().any(|t| t == value),
        "host" => glob_match(value, &vm.host),
        "cluster" => glob_match(value, &vm.cluster),
        "dc" => vm.datacenter == value,
        "state" => power_state_str(vm.power_state).contains(value),
        "firmware" => match value {
            "bios" => vm.firmware == Firmware::Bios,
            "efi" => vm.firmware == Firmware::Efi,
            _ => false,
        },
        _ => false,
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    glob::Pattern::new(pattern).map(|p| p.matches(text)).unwrap_or(false)
}

fn power_state_str(state: PowerState) -> &'static str {
    match state {
        PowerState::PoweredOn => "poweredOn",
        PowerState::PoweredOff => "poweredOff",
        PowerState::Suspended => "suspended",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmw2scw_types::{Controller, DiskSpec};

    fn vm(name: &str, host: &str, cluster: &str, os_id: &str, firmware: Firmware) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            moref: "vm-1".into(),
            power_state: PowerState::PoweredOn,
            cpu: 2,
            memory_mb: 4096,
            guest_os_id: os_id.to_string(),
            guest_os_full: os_id.to_string(),
            firmware,
            disks: vec![DiskSpec {
                size_gb: 40.0,
                thin: true,
                datastore: "ds1".into(),
                file_path: "x".into(),
                controller: Controller::Scsi,
                raw_device_mapping: false,
            }],
            nics: vec![],
            host: host.to_string(),
            cluster: cluster.to_string(),
            datacenter: "dc-1".into(),
            folder: "/dc-1/vm/prod".into(),
            tags: vec!["keep".into()],
            tools_status: "toolsOk".into(),
            uuid: "u-1".into(),
            snapshots: vec![],
        }
    }

    #[test]
    fn bare_string_defaults_to_name() {
        let (filter, warnings) = InventoryFilter::parse(&["web-01".to_string()]);
        assert!(warnings.is_empty());
        assert!(filter.matches(&vm("web-01", "esxi-1", "c1", "ubuntu64Guest", Firmware::Bios)));
        assert!(!filter.matches(&vm("db-01", "esxi-1", "c1", "ubuntu64Guest", Firmware::Bios)));
    }

    #[test]
    fn same_key_disjoins() {
        let (filter, _) = InventoryFilter::parse(&["name:web-*".to_string(), "name:db-*".to_string()]);
        assert!(filter.matches(&vm("web-01", "h", "c", "ubuntu64Guest", Firmware::Bios)));
        assert!(filter.matches(&vm("db-01", "h", "c", "ubuntu64Guest", Firmware::Bios)));
        assert!(!filter.matches(&vm("template-ubuntu", "h", "c", "ubuntu64Guest", Firmware::Bios)));
    }

    #[test]
    fn different_keys_conjoin() {
        let (filter, _) = InventoryFilter::parse(&[
            "name:web-*".to_string(),
            "host:esxi-2".to_string(),
        ]);
        assert!(!filter.matches(&vm("web-01", "esxi-1", "c", "ubuntu64Guest", Firmware::Bios)));
        assert!(filter.matches(&vm("web-01", "esxi-2", "c", "ubuntu64Guest", Firmware::Bios)));
    }

    #[test]
    fn unknown_key_warns_and_is_ignored() {
        let (filter, warnings) = InventoryFilter::parse(&["bogus:value".to_string()]);
        assert_eq!(warnings.len(), 1);
        // An empty predicate set (the only predicate was dropped) matches everything.
        assert!(filter.matches(&vm("anything", "h", "c", "ubuntu64Guest", Firmware::Bios)));
    }

    #[test]
    fn os_family_predicate() {
        let (filter, _) = InventoryFilter::parse(&["os:windows".to_string()]);
        assert!(filter.matches(&vm("w", "h", "c", "windows11_64Guest", Firmware::Efi)));
        assert!(!filter.matches(&vm("l", "h", "c", "ubuntu64Guest", Firmware::Bios)));
    }

    #[test]
    fn firmware_predicate() {
        let (filter, _) = InventoryFilter::parse(&["firmware:efi".to_string()]);
        assert!(filter.matches(&vm("w", "h", "c", "windows11_64Guest", Firmware::Efi)));
        assert!(!filter.matches(&vm("l", "h", "c", "ubuntu64Guest", Firmware::Bios)));
    }

    #[test]
    fn resource_ranges_conjoin_with_each_other_and_with_predicates() {
        let small = vm("web-01", "esxi-1", "c1", "ubuntu64Guest", Firmware::Bios); // cpu=2, ram=4GB, disk=40GB, 1 disk

        let (filter, _) = InventoryFilter::parse_with_ranges(&[], ResourceRanges { min_cpu: Some(4), ..Default::default() });
        assert!(!filter.matches(&small));

        let (filter, _) = InventoryFilter::parse_with_ranges(&[], ResourceRanges { max_cpu: Some(4), ..Default::default() });
        assert!(filter.matches(&small));

        let (filter, _) = InventoryFilter::parse_with_ranges(&[], ResourceRanges { min_ram_gb: Some(8.0), ..Default::default() });
        assert!(!filter.matches(&small));

        let (filter, _) = InventoryFilter::parse_with_ranges(&[], ResourceRanges { max_ram_gb: Some(8.0), ..Default::default() });
        assert!(filter.matches(&small));

        let (filter, _) = InventoryFilter::parse_with_ranges(&[], ResourceRanges { min_disk_gb: Some(100.0), ..Default::default() });
        assert!(!filter.matches(&small));

        let (filter, _) = InventoryFilter::parse_with_ranges(&[], ResourceRanges { max_disk_gb: Some(100.0), ..Default::default() });
        assert!(filter.matches(&small));

        let (filter, _) = InventoryFilter::parse_with_ranges(&[], ResourceRanges { max_disk_count: Some(0), ..Default::default() });
        assert!(!filter.matches(&small));

        // A range conjoins with a `key:value` predicate: name matches but CPU doesn't.
        let (filter, _) =
            InventoryFilter::parse_with_ranges(&["name:web-*".to_string()], ResourceRanges { min_cpu: Some(4), ..Default::default() });
        assert!(!filter.matches(&small));
    }

    #[test]
    fn truth_table_per_key() {
        // §8 Testable Property 4: for every predicate key, k:a + k:b matches
        // iff k:a or k:b does; predicates on different keys conjoin.
        let sample = vm("web-07", "esxi-3", "cluster-b", "ubuntu64Guest", Firmware::Bios);
        for (key, a, b, should_match_a) in [
            ("name", "web-*", "db-*", true),
            ("host", "esxi-3", "esxi-9", true),
            ("cluster", "cluster-b", "cluster-z", true),
        ] {
            let (single_a, _) = InventoryFilter::parse(&[format!("{key}:{a}")]);
            let (single_b, _) = InventoryFilter::parse(&[format!("{key}:{b}")]);
            let (union, _) = InventoryFilter::parse(&[format!("{key}:{a}"), format!("{key}:{b}")]);
            assert_eq!(single_a.matches(&sample), should_match_a);
            assert_eq!(union.matches(&sample), single_a.matches(&sample) || single_b.matches(&sample));
        }
    }
}
