//! Maps a source guest-OS identifier to an OS family and a human label
//! (§4.1 OSClassifier).

use vmw2scw_types::OsFamily;

/// Direct `guestId` → (family, label) lookup table, carried verbatim from
/// the source's `GUEST_OS_MAP`.
const GUEST_OS_MAP: &[(&str, OsFamily, &str)] = &[
    ("windows9Server64Guest", OsFamily::Windows, "Windows Server 2016+"),
    ("windows2019srv_64Guest", OsFamily::Windows, "Windows Server 2019"),
    ("windows2019srvNext_64Guest", OsFamily::Windows, "Windows Server 2022"),
    ("windows9_64Guest", OsFamily::Windows, "Windows 10"),
    ("windows11_64Guest", OsFamily::Windows, "Windows 11"),
    ("debian10_64Guest", OsFamily::Linux, "Debian 10"),
    ("debian11_64Guest", OsFamily::Linux, "Debian 11"),
    ("debian12_64Guest", OsFamily::Linux, "Debian 12"),
    ("ubuntu64Guest", OsFamily::Linux, "Ubuntu"),
    ("rhel7_64Guest", OsFamily::Linux, "RHEL 7"),
    ("rhel8_64Guest", OsFamily::Linux, "RHEL 8"),
    ("rhel9_64Guest", OsFamily::Linux, "RHEL 9"),
    ("centos7_64Guest", OsFamily::Linux, "CentOS 7"),
    ("centos8_64Guest", OsFamily::Linux, "CentOS 8"),
    ("centos9_64Guest", OsFamily::Linux, "CentOS Stream 9"),
    ("rockylinux_64Guest", OsFamily::Linux, "Rocky Linux"),
    ("almalinux_64Guest", OsFamily::Linux, "AlmaLinux"),
    ("sles15_64Guest", OsFamily::Linux, "SLES 15"),
    ("amazonlinux3_64Guest", OsFamily::Linux, "Amazon Linux"),
    ("other3xLinux64Guest", OsFamily::Linux, "Linux (generic 3.x)"),
    ("other4xLinux64Guest", OsFamily::Linux, "Linux (generic 4.x)"),
    ("other5xLinux64Guest", OsFamily::Linux, "Linux (generic 5.x)"),
    ("otherLinux64Guest", OsFamily::Linux, "Linux (generic)"),
    ("otherGuest64", OsFamily::Linux, "Other 64-bit"),
];

const LINUX_SUBSTRINGS: &[&str] = &[
    "linux", "ubuntu", "debian", "centos", "rhel", "rocky", "alma", "suse", "fedora",
];

/// Classify a source `guest_os_id` into a family and a human-readable
/// label (§4.1).
///
/// Direct lookups take precedence; otherwise a case-insensitive substring
/// test decides, failing open to `linux` with an `Unknown(<id>)` label so
/// the pipeline is still attempted rather than refused outright.
pub fn classify(guest_os_id: &str) -> (OsFamily, String) {
    if let Some((_, family, label)) = GUEST_OS_MAP.iter().find(|(id, _, _)| *id == guest_os_id) {
        return (*family, label.to_string());
    }

    let lower = guest_os_id.to_lowercase();
    if lower.contains("win") {
        return (OsFamily::Windows, format!("Windows ({guest_os_id})"));
    }
    if LINUX_SUBSTRINGS.iter().any(|k| lower.contains(k)) {
        return (OsFamily::Linux, format!("Linux ({guest_os_id})"));
    }
    (OsFamily::Linux, format!("Unknown({guest_os_id})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_lookup_wins() {
        let (family, label) = classify("windows11_64Guest");
        assert_eq!(family, OsFamily::Windows);
        assert_eq!(label, "Windows 11");
    }

    #[test]
    fn fuzzy_windows_match() {
        let (family, _) = classify("windows2025ServerGuest");
        assert_eq!(family, OsFamily::Windows);
    }

    #[test]
    fn fuzzy_linux_match() {
        let (family, _) = classify("freebsd64Guest-ubuntu-wrapper");
        assert_eq!(family, OsFamily::Linux);
    }

    #[test]
    fn unknown_fails_open_to_linux() {
        let (family, label) = classify("solaris10_64Guest");
        assert_eq!(family, OsFamily::Linux);
        assert!(label.starts_with("Unknown("));
    }
}
