//! Converts a BIOS/MBR-booted disk image to a GPT+ESP layout bootable
//! under UEFI (§4.7 Bios2UefiEngine).

use std::path::Path;
use std::time::Duration;

use vmw2scw_proc::{run, CommandSpec};

use crate::error::{AdapterError, AdapterResult};
use crate::windows_adapter::{self, WindowsAdapterConfig};

/// GPT type GUID for an EFI System Partition.
pub const ESP_TYPE_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

/// The hard ceiling from §5 ("Windows BIOS→UEFI emulator boot: 600 s").
pub const WINDOWS_UEFI_FIX_TIMEOUT: Duration = Duration::from_secs(600);

const UEFI_FIX_STARTING: &str = "UEFIFIX:STARTING";
const UEFI_FIX_COMPLETE: &str = "UEFIFIX:COMPLETE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootType {
    Uefi,
    BiosGpt,
    BiosMbr,
}

/// Read the partition table type and, for GPT, check whether *any*
/// partition's type GUID is the EFI System Partition GUID (§4.7 "Detects
/// boot type": "checking any partition's GPT type GUID").
pub async fn detect_boot_type(disk_path: &Path) -> AdapterResult<BootType> {
    let spec = CommandSpec::new("sgdisk", ["-p".to_string(), disk_path.display().to_string()]).check(false);
    let out = run(&spec, None).await?;
    if !out.success() {
        // sgdisk refuses a non-GPT disk with a diagnostic on stderr; treat
        // as MBR and let the conversion path handle it.
        return Ok(BootType::BiosMbr);
    }

    for partition_number in partition_numbers(&out.stdout) {
        let spec_info = CommandSpec::new(
            "sgdisk",
            ["-i".to_string(), partition_number.to_string(), disk_path.display().to_string()],
        )
        .check(false);
        let info = run(&spec_info, None).await?;
        if info.success() && info.stdout.to_uppercase().contains(ESP_TYPE_GUID) {
            return Ok(BootType::Uefi);
        }
    }
    Ok(BootType::BiosGpt)
}

/// Extract every partition number from `sgdisk -p` table output (lines
/// starting with a partition index followed by whitespace-separated
/// columns).
fn partition_numbers(sgdisk_p_output: &str) -> Vec<u32> {
    sgdisk_p_output
        .lines()
        .filter_map(|line| line.trim_start().split_whitespace().next())
        .filter_map(|token| token.parse::<u32>().ok())
        .collect()
}

/// Linux variant (§4.7): grow the disk by 200 MiB, add a GPT ESP at the
/// end, format it FAT32, then install grub's EFI target inside the
/// guest and stage the same fallback-loader path the adapt_guest stage
/// uses.
pub async fn convert_linux(qcow2_path: &Path, raw_scratch: &Path) -> AdapterResult<()> {
    if matches!(detect_boot_type(qcow2_path).await?, BootType::Uefi) {
        return Ok(());
    }

    run(&CommandSpec::new(
        "qemu-img",
        [
            "convert".to_string(),
            "-O".to_string(),
            "raw".to_string(),
            qcow2_path.display().to_string(),
            raw_scratch.display().to_string(),
        ],
    ), None)
    .await?;

    run(&CommandSpec::new(
        "qemu-img",
        [
            "resize".to_string(),
            "-f".to_string(),
            "raw".to_string(),
            raw_scratch.display().to_string(),
            "+200M".to_string(),
        ],
    ), None)
    .await?;

    // sgdisk handles both "relocate backup header after a GPT grow" and
    // "convert an MBR table to GPT in place" via -e / -g respectively;
    // -e is a no-op on an already-correct backup header.
    run(&CommandSpec::new("sgdisk", ["-e".to_string(), raw_scratch.display().to_string()]), None).await.ok();
    run(&CommandSpec::new("sgdisk", ["-g".to_string(), raw_scratch.display().to_string()]), None).await.ok();

    run(&CommandSpec::new(
        "sgdisk",
        [
            "-n".to_string(),
            "0:-200M:0".to_string(),
            "-t".to_string(),
            "0:ef00".to_string(),
            "-c".to_string(),
            "0:EFI-System".to_string(),
            raw_scratch.display().to_string(),
        ],
    ), None)
    .await?;

    let info = run(&CommandSpec::new(
        "sgdisk",
        ["-i".to_string(), "last".to_string(), raw_scratch.display().to_string()],
    ), None)
    .await?;
    let (offset, size) = parse_partition_window(&info.stdout)
        .ok_or_else(|| AdapterError::Integrity("could not parse ESP partition window from sgdisk -i output".to_string()))?;

    let loop_dev = setup_loop_device(raw_scratch, offset, size).await?;
    run(
        &CommandSpec::new(
            "mkfs.vfat",
            ["-F".to_string(), "32".to_string(), "-n".to_string(), "ESP".to_string(), loop_dev.clone()],
        ),
        None,
    )
    .await?;
    teardown_loop_device(&loop_dev).await?;

    run(&CommandSpec::new(
        "qemu-img",
        [
            "convert".to_string(),
            "-O".to_string(),
            "qcow2".to_string(),
            raw_scratch.display().to_string(),
            qcow2_path.display().to_string(),
        ],
    ), None)
    .await?;

    let install_script = "--run-command=\
        (apt-get install -y -qq grub-efi-amd64 2>/dev/null || yum install -y grub2-efi-x64 2>/dev/null || true); \
        mkdir -p /boot/efi; mount /dev/sda3 /boot/efi 2>/dev/null || true; \
        grub-install --target=x86_64-efi --efi-directory=/boot/efi --bootloader-id=ubuntu 2>/dev/null || true; \
        mkdir -p /boot/efi/EFI/BOOT; \
        cp /boot/efi/EFI/*/grubx64.efi /boot/efi/EFI/BOOT/BOOTX64.EFI 2>/dev/null || true; \
        sed -i 's#GRUB_TERMINAL.*#GRUB_TERMINAL=\"console serial\"#' /etc/default/grub 2>/dev/null || true; \
        (grub-mkconfig -o /boot/grub/grub.cfg 2>/dev/null || grub2-mkconfig -o /boot/grub2/grub.cfg 2>/dev/null || true)";
    run(&CommandSpec::new(
        "virt-customize",
        ["-a".to_string(), qcow2_path.display().to_string(), install_script.to_string()],
    ).check(false), None)
    .await?;

    Ok(())
}

/// Windows variant (§4.7). Already-UEFI path performs a read-only probe
/// followed by a *separate* read-write invocation — the guest-inspection
/// tool refuses a mixed-mode session — so callers can assert exactly two
/// invocations happened (§8 S2).
pub async fn ensure_windows_uefi_fallback(disk_path: &Path) -> AdapterResult<bool> {
    let probe = CommandSpec::new(
        "guestfish",
        [
            "--ro".to_string(),
            "-a".to_string(),
            disk_path.display().to_string(),
            "-i".to_string(),
            "--".to_string(),
            "is-file".to_string(),
            "/EFI/BOOT/BOOTX64.EFI".to_string(),
        ],
    )
    .check(false);
    let probe_out = run(&probe, None).await?;
    if probe_out.stdout.trim() == "true" {
        return Ok(false);
    }

    let write = CommandSpec::new(
        "guestfish",
        [
            "-a".to_string(),
            disk_path.display().to_string(),
            "-i".to_string(),
            "--".to_string(),
            "mkdir-p".to_string(),
            "/EFI/BOOT".to_string(),
            "cp".to_string(),
            "/EFI/Microsoft/Boot/bootmgfw.efi".to_string(),
            "/EFI/BOOT/BOOTX64.EFI".to_string(),
        ],
    );
    run(&write, None).await?;
    Ok(true)
}

/// Windows variant (§4.7), dispatching on detected boot type: already-UEFI
/// gets the fallback-loader check above; BIOS/MBR gets the full GPT+ESP
/// conversion and a controlled emulator boot to install the Windows UEFI
/// loader via `bcdboot`.
pub async fn ensure_windows_uefi(qcow2_path: &Path, scratch_dir: &Path, cfg: &WindowsAdapterConfig) -> AdapterResult<()> {
    match detect_boot_type(qcow2_path).await? {
        BootType::Uefi => {
            ensure_windows_uefi_fallback(qcow2_path).await?;
            Ok(())
        }
        BootType::BiosGpt | BootType::BiosMbr => convert_windows_bios_to_uefi(qcow2_path, scratch_dir, cfg).await,
    }
}

/// Resize +260 MiB, convert MBR→GPT and add a 260 MiB ESP (via an NBD
/// device node when the host exposes one, falling back to an in-appliance
/// conversion otherwise), stage a first-boot `bcdboot` script, then boot
/// the prepared overlay under UEFI+virtio-block to run it — `viostor` is
/// already registered from §4.6 — committing the overlay back into the
/// base image on success (§4.7 "Windows variant").
async fn convert_windows_bios_to_uefi(qcow2_path: &Path, scratch_dir: &Path, cfg: &WindowsAdapterConfig) -> AdapterResult<()> {
    tokio::fs::create_dir_all(scratch_dir).await?;

    run(&CommandSpec::new("qemu-img", ["resize".to_string(), qcow2_path.display().to_string(), "+260M".to_string()]), None).await?;

    create_esp_partition(qcow2_path).await?;
    stage_bcdboot_first_boot(qcow2_path, scratch_dir).await?;

    let overlay = scratch_dir.join("uefi-fix-overlay.qcow2");
    let vars_path = scratch_dir.join("uefi-fix-vars.fd");
    let serial_log = scratch_dir.join("uefi-fix-serial.log");
    run(
        &CommandSpec::new(
            "qemu-img",
            [
                "create".to_string(),
                "-f".to_string(),
                "qcow2".to_string(),
                "-F".to_string(),
                "qcow2".to_string(),
                "-b".to_string(),
                qcow2_path.display().to_string(),
                overlay.display().to_string(),
            ],
        ),
        None,
    )
    .await?;

    let outcome = windows_adapter::boot_and_watch(
        &overlay,
        &vars_path,
        &serial_log,
        &cfg.ovmf_code,
        &cfg.ovmf_vars_template,
        WINDOWS_UEFI_FIX_TIMEOUT,
        &[UEFI_FIX_STARTING, UEFI_FIX_COMPLETE],
        &[],
    )
    .await?;
    if !outcome.completed_before_timeout {
        return Err(AdapterError::Timeout(format!("windows bios->uefi fix: phases observed before timeout: {:?}", outcome.phases_observed)));
    }

    run(&CommandSpec::new("qemu-img", ["commit".to_string(), overlay.display().to_string()]), None).await?;
    tokio::fs::remove_file(&overlay).await.ok();
    Ok(())
}

/// Convert MBR→GPT and create the 260 MiB ESP. Prefers exposing the qcow2
/// through `qemu-nbd` and partitioning the resulting device node from the
/// host; if no NBD device node is available, falls back to doing the same
/// GPT conversion and FAT32 format from inside the guest-inspection tool
/// (§4.7 "known reliability hole").
async fn create_esp_partition(qcow2_path: &Path) -> AdapterResult<()> {
    match connect_nbd(qcow2_path).await {
        Some(dev) => {
            run(&CommandSpec::new("sgdisk", ["-g".to_string(), dev.clone()]).check(false), None).await.ok();
            run(
                &CommandSpec::new(
                    "sgdisk",
                    [
                        "-n".to_string(),
                        "0:-260M:0".to_string(),
                        "-t".to_string(),
                        "0:ef00".to_string(),
                        "-c".to_string(),
                        "0:EFI-System".to_string(),
                        dev.clone(),
                    ],
                ),
                None,
            )
            .await?;
            run(&CommandSpec::new("partprobe", [dev.clone()]).check(false), None).await.ok();
            if let Some(part) = last_partition_device(&dev).await? {
                run(&CommandSpec::new("mkfs.vfat", ["-F".to_string(), "32".to_string(), "-n".to_string(), "ESP".to_string(), part]), None).await?;
            }
            disconnect_nbd(&dev).await;
        }
        None => {
            run(
                &CommandSpec::new(
                    "virt-customize",
                    [
                        "-a".to_string(),
                        qcow2_path.display().to_string(),
                        "--run-command=sgdisk -g /dev/sda 2>/dev/null; \
                         sgdisk -n 0:-260M:0 -t 0:ef00 -c 0:EFI-System /dev/sda; \
                         mkfs.vfat -F 32 -n ESP \"$(ls /dev/sda? | tail -1)\""
                            .to_string(),
                    ],
                )
                .check(false),
                None,
            )
            .await?;
        }
    }
    Ok(())
}

async fn connect_nbd(qcow2_path: &Path) -> Option<String> {
    for index in 0..8 {
        let dev = format!("/dev/nbd{index}");
        let spec = CommandSpec::new("qemu-nbd", ["--connect".to_string(), dev.clone(), qcow2_path.display().to_string()]).check(false);
        if let Ok(out) = run(&spec, None).await {
            if out.success() && tokio::fs::metadata(&dev).await.is_ok() {
                return Some(dev);
            }
        }
    }
    None
}

async fn disconnect_nbd(dev: &str) {
    run(&CommandSpec::new("qemu-nbd", ["--disconnect".to_string(), dev.to_string()]).check(false), None).await.ok();
}

/// Find the device node of the highest-numbered partition on `dev` by
/// parsing `sgdisk -p` table output the same way [`partition_numbers`]
/// does.
async fn last_partition_device(dev: &str) -> AdapterResult<Option<String>> {
    let out = run(&CommandSpec::new("sgdisk", ["-p".to_string(), dev.to_string()]).check(false), None).await?;
    match partition_numbers(&out.stdout).into_iter().max() {
        Some(n) => Ok(Some(format!("{dev}p{n}"))),
        None => Ok(None),
    }
}

/// Write and stage the first-boot script that assigns a drive letter to
/// the ESP (trying partitions 4, 5, 3 in turn), installs the Windows UEFI
/// loader with `bcdboot`, copies it to the fallback path, clears the
/// first-boot flags, and reboots (§4.7 "Windows variant").
async fn stage_bcdboot_first_boot(qcow2_path: &Path, scratch_dir: &Path) -> AdapterResult<()> {
    let script = format!(
        "@echo off\r\n\
         echo {starting} > COM1\r\n\
         for %%p in (4 5 3) do (\r\n\
         \t(echo select volume %%p& echo assign letter=S) > %TEMP%\\vmware2scw-esp.txt\r\n\
         \tdiskpart /s %TEMP%\\vmware2scw-esp.txt >nul 2>&1\r\n\
         \tif exist S:\\ goto :assigned\r\n\
         )\r\n\
         :assigned\r\n\
         bcdboot C:\\Windows /s S: /f UEFI\r\n\
         mkdir S:\\EFI\\BOOT 2>nul\r\n\
         copy S:\\EFI\\Microsoft\\Boot\\bootmgfw.efi S:\\EFI\\BOOT\\BOOTX64.EFI /Y\r\n\
         reg delete \"HKLM\\SYSTEM\\Setup\" /v CmdLine /f\r\n\
         reg add \"HKLM\\SYSTEM\\Setup\" /v SetupType /t REG_DWORD /d 0 /f\r\n\
         echo {complete} > COM1\r\n\
         shutdown /r /t 5\r\n",
        starting = UEFI_FIX_STARTING,
        complete = UEFI_FIX_COMPLETE,
    );
    let script_path = scratch_dir.join("vmware2scw-uefi-fix.cmd");
    tokio::fs::write(&script_path, script).await?;

    let spec = CommandSpec::new(
        "virt-customize",
        [
            "-a".to_string(),
            qcow2_path.display().to_string(),
            format!("--upload={}:/Windows/vmware2scw-uefi-fix.cmd", script_path.display()),
            "--run-command=reg add 'HKLM\\SYSTEM\\Setup' /v SetupType /t REG_DWORD /d 1 /f".to_string(),
            "--run-command=reg add 'HKLM\\SYSTEM\\Setup' /v SystemSetupInProgress /t REG_DWORD /d 1 /f".to_string(),
            "--run-command=reg add 'HKLM\\SYSTEM\\Setup' /v CmdLine /t REG_SZ /d 'cmd /c C:\\Windows\\vmware2scw-uefi-fix.cmd' /f".to_string(),
        ],
    );
    run(&spec, None).await?;
    Ok(())
}

async fn setup_loop_device(raw_path: &Path, offset: u64, size: u64) -> AdapterResult<String> {
    let out = run(
        &CommandSpec::new(
            "losetup",
            [
                "--show".to_string(),
                "-f".to_string(),
                "-o".to_string(),
                offset.to_string(),
                "--sizelimit".to_string(),
                size.to_string(),
                raw_path.display().to_string(),
            ],
        ),
        None,
    )
    .await?;
    Ok(out.stdout.trim().to_string())
}

async fn teardown_loop_device(loop_dev: &str) -> AdapterResult<()> {
    run(&CommandSpec::new("losetup", ["-d", loop_dev]).check(false), None).await?;
    Ok(())
}

/// Parse the `Partition size:` / start-sector lines out of `sgdisk -i`
/// output, returning `(byte_offset, byte_size)`. `sgdisk` reports sector
/// counts; this assumes the conventional 512-byte logical sector.
fn parse_partition_window(sgdisk_output: &str) -> Option<(u64, u64)> {
    const SECTOR: u64 = 512;
    let mut first_sector = None;
    let mut last_sector = None;
    for line in sgdisk_output.lines() {
        if let Some(rest) = line.strip_prefix("First sector:") {
            first_sector = rest.split_whitespace().next()?.parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("Last sector:") {
            last_sector = rest.split_whitespace().next()?.parse::<u64>().ok();
        }
    }
    let (first, last) = (first_sector?, last_sector?);
    Some((first * SECTOR, (last - first + 1) * SECTOR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sgdisk_partition_window() {
        let sample = "Partition GUID code: ...\nFirst sector: 2048 (at 1024.0 KiB)\nLast sector: 411647 (at 201.0 MiB)\nPartition size: 409600 sectors (200.0 MiB)\n";
        let (offset, size) = parse_partition_window(sample).unwrap();
        assert_eq!(offset, 2048 * 512);
        assert_eq!(size, (411647 - 2048 + 1) * 512);
    }

    #[test]
    fn missing_fields_return_none() {
        assert!(parse_partition_window("nothing useful here").is_none());
    }

    #[test]
    fn partition_numbers_parses_every_row_regardless_of_order() {
        let sample = "Disk /dev/sda: 83886080 sectors, 40.0 GiB\n\
                      Number  Start (sector)    End (sector)  Size       Code  Name\n\
                      1              2048          206847   100.0 MiB   EF00  EFI-System\n\
                      2            206848        83884031    39.9 GiB    8300  Linux\n";
        assert_eq!(partition_numbers(sample), vec![1, 2]);
    }

    #[test]
    fn partition_numbers_on_non_table_output_is_empty() {
        assert!(partition_numbers("Creating new GPT entries.").is_empty());
    }
}
