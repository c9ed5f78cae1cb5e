//! Offline Linux guest adaptation: one guest-inspection invocation that
//! strips the source hypervisor's tools, injects virtio drivers into the
//! initramfs, retargets disk device names, and stages a UEFI fallback
//! loader (§4.5 `adapt_guest`).

use std::path::Path;

use vmw2scw_proc::{run, CommandSpec};

use crate::error::AdapterResult;

/// Outcome of one `adapt_guest` invocation. The overall exit code of the
/// guest-inspection tool is informational only — every command inside is
/// best-effort, so a non-zero exit is logged, not propagated as a stage
/// failure (§4.5).
#[derive(Debug)]
pub struct AdaptGuestOutcome {
    pub tool_exit_success: bool,
    pub stderr_tail: String,
}

/// Well-known per-distribution EFI fallback-binary source paths, probed
/// in order; the first one present is copied to the fallback path.
const EFI_FALLBACK_CANDIDATES: &[&str] = &[
    "/boot/efi/EFI/ubuntu/shimx64.efi",
    "/boot/efi/EFI/debian/shimx64.efi",
    "/boot/efi/EFI/centos/shimx64.efi",
    "/boot/efi/EFI/redhat/shimx64.efi",
    "/boot/efi/EFI/fedora/shimx64.efi",
    "/boot/efi/EFI/opensuse/shimx64.efi",
];

/// Run the single merged guest-inspection pass over `boot_disk` (§4.5
/// `adapt_guest`). `source_firmware_efi` controls whether the EFI
/// fallback-loader probe/copy step runs.
pub async fn adapt_guest(boot_disk: &Path, source_firmware_efi: bool) -> AdapterResult<AdaptGuestOutcome> {
    let mut commands = Vec::new();

    // Remove source-hypervisor guest additions across every package
    // manager the image might use; each is independently best-effort.
    commands.push(shell(
        "(apt-get remove -y open-vm-tools open-vm-tools-desktop 2>/dev/null || true); \
         (yum remove -y open-vm-tools 2>/dev/null || true); \
         (zypper remove -y open-vm-tools 2>/dev/null || true)",
    ));
    commands.push(shell(
        "rm -f /etc/udev/rules.d/*vmware* /etc/udev/rules.d/*open-vm* 2>/dev/null || true; \
         systemctl disable vmtoolsd open-vm-tools 2>/dev/null || true",
    ));

    // Inject virtio modules into whichever initramfs tool is present.
    commands.push(shell(
        "if command -v update-initramfs >/dev/null; then \
           echo 'virtio_blk\\nvirtio_scsi\\nvirtio_net\\nvirtio_pci' >> /etc/initramfs-tools/modules; \
           update-initramfs -u -k all; \
         elif command -v dracut >/dev/null; then \
           dracut --force --add-drivers 'virtio_blk virtio_scsi virtio_net virtio_pci'; \
         fi || true",
    ));

    // Retarget /etc/fstab and the grub device-map from sd* to vd*.
    commands.push(shell(
        "cp /etc/fstab /etc/fstab.vmware2scw.bak 2>/dev/null; \
         sed -i 's#/dev/sd#/dev/vd#g' /etc/fstab 2>/dev/null || true",
    ));
    commands.push(shell(
        "cp /etc/default/grub /etc/default/grub.vmware2scw.bak 2>/dev/null; \
         sed -i 's#/dev/sd#/dev/vd#g' /etc/default/grub 2>/dev/null || true",
    ));

    // Serial console + DHCP + regenerated bootloader config.
    commands.push(shell(
        "sed -i 's#GRUB_CMDLINE_LINUX=\"#GRUB_CMDLINE_LINUX=\"console=tty1 console=ttyS0,115200n8 #' \
           /etc/default/grub 2>/dev/null || true; \
         sed -i 's#GRUB_TERMINAL.*#GRUB_TERMINAL=\"console serial\"#' /etc/default/grub 2>/dev/null || true",
    ));
    commands.push(shell(
        "(grub-mkconfig -o /boot/grub/grub.cfg 2>/dev/null || true); \
         (grub2-mkconfig -o /boot/grub2/grub.cfg 2>/dev/null || true)",
    ));
    commands.push(shell("rm -f /etc/udev/rules.d/70-persistent-net.rules 2>/dev/null || true"));
    commands.push(shell(
        "mkdir -p /etc/netplan 2>/dev/null; \
         printf 'network:\\n  version: 2\\n  ethernets:\\n    all-en:\\n      match:\\n        name: \"en*\"\\n      dhcp4: true\\n' \
           > /etc/netplan/99-vmware2scw-dhcp.yaml 2>/dev/null || true",
    ));

    if source_firmware_efi {
        let probe = EFI_FALLBACK_CANDIDATES
            .iter()
            .map(|p| format!("if [ -f {p} ]; then mkdir -p /boot/efi/EFI/BOOT; cp {p} /boot/efi/EFI/BOOT/BOOTX64.EFI; fi"))
            .collect::<Vec<_>>()
            .join("; ");
        commands.push(shell(&format!("{probe} || true")));
    }

    let spec = CommandSpec::new("virt-customize", std::iter::once("-a".to_string()).chain(std::iter::once(boot_disk.display().to_string())).chain(commands))
        .check(false);
    let output = run(&spec, None).await?;

    Ok(AdaptGuestOutcome {
        tool_exit_success: output.success(),
        stderr_tail: tail(&output.stderr, 500),
    })
}

fn shell(script: &str) -> String {
    format!("--run-command={script}")
}

fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        s.to_string()
    } else {
        s[s.len() - max_bytes..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_truncates_to_cap() {
        let long = "x".repeat(1000);
        assert_eq!(tail(&long, 500).len(), 500);
    }

    #[test]
    fn tail_is_noop_under_cap() {
        assert_eq!(tail("short", 500), "short");
    }
}
