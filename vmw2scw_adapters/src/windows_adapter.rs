//! Windows guest adaptation (§4.6 `inject_virtio`): offline driver/
//! registry staging, then one controlled emulator boot that merges the
//! driver-store install and the virtio-SCSI PnP bind into a single pass.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use vmw2scw_proc::{run, CommandSpec, OutputMode};

use crate::error::{AdapterError, AdapterResult};

/// The five serial tokens the first-boot script writes to COM1, in order
/// (§6 "Serial-console protocol").
pub const PHASE_STARTING: &str = "PHASE:STARTING";
pub const PHASE_PNPUTIL: &str = "PHASE:PNPUTIL";
pub const PHASE_DHCP: &str = "PHASE:DHCP";
pub const PHASE_EMS: &str = "PHASE:EMS";
pub const PHASE_COMPLETE: &str = "PHASE:COMPLETE";

const VIRTIO_DRIVERS: &[(&str, &str)] = &[
    ("viostor", "SCSI miniport"),
    ("vioscsi", "SCSI miniport"),
    ("netkvm", "NDIS"),
];

/// Configuration the caller resolves once per batch (paths are static
/// across VMs).
#[derive(Debug, Clone)]
pub struct WindowsAdapterConfig {
    pub virtio_win_iso: PathBuf,
    pub ovmf_code: PathBuf,
    pub ovmf_vars_template: PathBuf,
    pub emulator_boot_timeout: Duration,
}

impl WindowsAdapterConfig {
    /// The hard ceiling from §5 ("Windows phase-2 emulator boot: 420 s").
    pub fn default_timeout() -> Duration {
        Duration::from_secs(420)
    }
}

#[derive(Debug)]
pub struct InjectVirtioOutcome {
    pub phases_observed: Vec<String>,
    pub completed_before_timeout: bool,
}

/// Phase 1 — offline staging: repair the dirty NTFS flag, extract the
/// virtio driver set from the ISO, stage driver files and registry
/// fragments, write the first-boot script (§4.6 phase 1).
pub async fn offline_prepare(
    boot_disk: &Path,
    staging_dir: &Path,
    cfg: &WindowsAdapterConfig,
) -> AdapterResult<()> {
    tokio::fs::create_dir_all(staging_dir).await?;

    repair_ntfs_dirty_flag(boot_disk).await?;

    let drivers_dir = staging_dir.join("drivers");
    tokio::fs::create_dir_all(&drivers_dir).await?;
    for (name, _group) in VIRTIO_DRIVERS {
        extract_driver(&cfg.virtio_win_iso, name, &drivers_dir).await?;
    }

    write_first_boot_script(staging_dir).await?;

    let mut commands = Vec::new();
    for (name, _) in VIRTIO_DRIVERS {
        commands.push(format!(
            "--upload={}:/Windows/System32/drivers/{name}.sys",
            drivers_dir.join(name).join(format!("{name}.sys")).display()
        ));
        commands.push(format!(
            "--copy-in={}:/Drivers/",
            drivers_dir.join(name).display()
        ));
    }
    commands.push(format!(
        "--upload={}:/Windows/vmware2scw-setup.cmd",
        staging_dir.join("vmware2scw-setup.cmd").display()
    ));
    // Registry: boot-critical service registrations for each virtio driver,
    // the first-boot CmdLine trigger, per-adapter DHCP, and disabled
    // crash auto-restart, all merged through the guest-inspection tool's
    // registry editing facility in one pass.
    for (name, group) in VIRTIO_DRIVERS {
        commands.push(format!(
            "--run-command=reg add 'HKLM\\SYSTEM\\CurrentControlSet\\Services\\{name}' /v Start /t REG_DWORD /d 0 /f"
        ));
        commands.push(format!(
            "--run-command=reg add 'HKLM\\SYSTEM\\CurrentControlSet\\Services\\{name}' /v Type /t REG_DWORD /d 1 /f"
        ));
        commands.push(format!(
            "--run-command=reg add 'HKLM\\SYSTEM\\CurrentControlSet\\Services\\{name}' /v ErrorControl /t REG_DWORD /d 1 /f"
        ));
        commands.push(format!(
            "--run-command=reg add 'HKLM\\SYSTEM\\CurrentControlSet\\Services\\{name}' /v Group /t REG_SZ /d '{group}' /f"
        ));
        commands.push(format!(
            "--run-command=reg add 'HKLM\\SYSTEM\\CurrentControlSet\\Services\\{name}' /v ImagePath /t REG_SZ /d 'system32\\drivers\\{name}.sys' /f"
        ));
    }
    commands.push(
        "--run-command=reg add 'HKLM\\SYSTEM\\Setup' /v SetupType /t REG_DWORD /d 1 /f".to_string(),
    );
    commands.push(
        "--run-command=reg add 'HKLM\\SYSTEM\\Setup' /v SystemSetupInProgress /t REG_DWORD /d 1 /f".to_string(),
    );
    commands.push(
        "--run-command=reg add 'HKLM\\SYSTEM\\Setup' /v CmdLine /t REG_SZ /d 'cmd /c C:\\Windows\\vmware2scw-setup.cmd' /f".to_string(),
    );
    commands.push(
        "--run-command=reg add 'HKLM\\SYSTEM\\CurrentControlSet\\Control\\CrashControl' /v AutoReboot /t REG_DWORD /d 0 /f".to_string(),
    );

    let spec = CommandSpec::new(
        "virt-customize",
        std::iter::once("-a".to_string())
            .chain(std::iter::once(boot_disk.display().to_string()))
            .chain(commands),
    )
    .env("VIRTIO_WIN", cfg.virtio_win_iso.display().to_string());
    run(&spec, None).await?;
    Ok(())
}

async fn repair_ntfs_dirty_flag(boot_disk: &Path) -> AdapterResult<()> {
    let spec = CommandSpec::new(
        "guestfish",
        [
            "-a".to_string(),
            boot_disk.display().to_string(),
            "-i".to_string(),
            "--".to_string(),
            "ntfsfix".to_string(),
            "/dev/sda2".to_string(),
        ],
    )
    .check(false);
    run(&spec, None).await?;
    Ok(())
}

async fn extract_driver(iso_path: &Path, driver_name: &str, dest: &Path) -> AdapterResult<()> {
    let driver_dest = dest.join(driver_name);
    tokio::fs::create_dir_all(&driver_dest).await?;
    // Newest-Windows-version-first search order; per-driver subdirectory
    // layout on the virtio-win ISO (<driver>/<winver>/amd64/*.{sys,inf,cat}).
    let spec = CommandSpec::new(
        "7z",
        [
            "e".to_string(),
            iso_path.display().to_string(),
            format!("-o{}", driver_dest.display()),
            format!("-ir!{driver_name}/w11/amd64/*"),
            "-y".to_string(),
        ],
    )
    .check(false);
    run(&spec, None).await?;
    Ok(())
}

async fn write_first_boot_script(staging_dir: &Path) -> AdapterResult<()> {
    let script = format!(
        "@echo off\r\n\
         echo {starting} > COM1\r\n\
         for /r C:\\Drivers %%f in (*.inf) do pnputil /add-driver \"%%f\" /install\r\n\
         echo {pnputil} > COM1\r\n\
         for /f \"tokens=*\" %%i in ('wmic nic get index') do netsh interface ip set address name=\"%%i\" dhcp\r\n\
         echo {dhcp} > COM1\r\n\
         reg add \"HKLM\\SYSTEM\\CurrentControlSet\\Control\\Terminal Server\" /v fDenyTSConnections /t REG_DWORD /d 0 /f\r\n\
         bcdedit /ems on\r\n\
         bcdedit /emssettings EMSPORT:1 EMSBAUDRATE:115200\r\n\
         echo {ems} > COM1\r\n\
         reg delete \"HKLM\\SYSTEM\\Setup\" /v CmdLine /f\r\n\
         reg add \"HKLM\\SYSTEM\\Setup\" /v SetupType /t REG_DWORD /d 0 /f\r\n\
         echo {complete} > COM1\r\n\
         shutdown /s /t 5\r\n",
        starting = PHASE_STARTING,
        pnputil = PHASE_PNPUTIL,
        dhcp = PHASE_DHCP,
        ems = PHASE_EMS,
        complete = PHASE_COMPLETE,
    );
    tokio::fs::write(staging_dir.join("vmware2scw-setup.cmd"), script).await?;
    Ok(())
}

/// Phase 2 — boot the prepared image under a controlled emulator with
/// both virtio-block (so viostor, already registered, boots the guest)
/// and a virtio-SCSI PCI controller attached (so PnP discovers and binds
/// vioscsi from the driver store in the same boot) (§4.6 phase 2).
pub async fn controlled_boot(
    overlay_path: &Path,
    vars_path: &Path,
    serial_log_path: &Path,
    cfg: &WindowsAdapterConfig,
) -> AdapterResult<InjectVirtioOutcome> {
    boot_and_watch(
        overlay_path,
        vars_path,
        serial_log_path,
        &cfg.ovmf_code,
        &cfg.ovmf_vars_template,
        cfg.emulator_boot_timeout,
        &[PHASE_STARTING, PHASE_PNPUTIL, PHASE_DHCP, PHASE_EMS, PHASE_COMPLETE],
        &["-device".to_string(), "virtio-scsi-pci".to_string()],
    )
    .await
}

/// Generic controlled emulator boot primitive: UEFI firmware, the
/// overlay attached via virtio-block, serial piped to a log file,
/// `no-reboot`, with a supervisor tailing the log for `expected_tokens`.
/// Shared by [`controlled_boot`] (virtio driver-store install, §4.6) and
/// `bios2uefi`'s Windows BIOS→UEFI emulator boot (§4.7) — the only two
/// places the system boots the guest.
pub async fn boot_and_watch(
    overlay_path: &Path,
    vars_path: &Path,
    serial_log_path: &Path,
    ovmf_code: &Path,
    ovmf_vars_template: &Path,
    timeout: Duration,
    expected_tokens: &[&str],
    extra_devices: &[String],
) -> AdapterResult<InjectVirtioOutcome> {
    tokio::fs::copy(ovmf_vars_template, vars_path).await?;

    let mut args = vec![
        "-machine".to_string(),
        "q35,accel=kvm".to_string(),
        "-m".to_string(),
        "2048".to_string(),
        "-drive".to_string(),
        format!("if=pflash,format=raw,readonly=on,file={}", ovmf_code.display()),
        "-drive".to_string(),
        format!("if=pflash,format=raw,file={}", vars_path.display()),
        "-drive".to_string(),
        format!("file={},if=virtio,format=qcow2", overlay_path.display()),
    ];
    args.extend(extra_devices.iter().cloned());
    args.extend([
        "-chardev".to_string(),
        format!("file,id=serial0,path={}", serial_log_path.display()),
        "-serial".to_string(),
        "chardev:serial0".to_string(),
        "-nographic".to_string(),
        "-no-reboot".to_string(),
    ]);

    let spec = CommandSpec::new("qemu-system-x86_64", args).timeout(timeout).mode(OutputMode::Inherit).check(false);

    let boot = tokio::spawn({
        let spec = spec.clone();
        async move { run(&spec, None).await }
    });

    let outcome = watch_serial_log(serial_log_path, timeout, expected_tokens).await?;

    boot.await.map_err(|e| AdapterError::Timeout(e.to_string()))??;

    Ok(outcome)
}

/// Tail the serial log at ~5 Hz, recording each expected token as it
/// appears and returning as soon as the last one is seen (§4.6 phase 2's
/// supervisor, §5 "Windows phase-2 emulator boot" / "Windows BIOS→UEFI
/// emulator boot").
async fn watch_serial_log(path: &Path, ceiling: Duration, expected: &[&str]) -> AdapterResult<InjectVirtioOutcome> {
    let deadline = tokio::time::Instant::now() + ceiling;
    let mut phases_observed = Vec::new();
    let terminal = expected.last().copied().unwrap_or(PHASE_COMPLETE);

    loop {
        if tokio::time::Instant::now() >= deadline {
            return Ok(InjectVirtioOutcome { phases_observed, completed_before_timeout: false });
        }
        if let Ok(file) = tokio::fs::File::open(path).await {
            let mut lines = BufReader::new(file).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for token in expected {
                    if line.contains(token) && !phases_observed.iter().any(|p| p == token) {
                        phases_observed.push(token.to_string());
                    }
                }
            }
        }
        if phases_observed.iter().any(|p| p == terminal) {
            tokio::time::sleep(Duration::from_secs(30).min(ceiling)).await;
            return Ok(InjectVirtioOutcome { phases_observed, completed_before_timeout: true });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_PHASES: [&str; 5] = [PHASE_STARTING, PHASE_PNPUTIL, PHASE_DHCP, PHASE_EMS, PHASE_COMPLETE];

    #[tokio::test]
    async fn watch_serial_log_detects_complete_token() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("serial.log");
        tokio::fs::write(&log, format!("{PHASE_STARTING}\n{PHASE_PNPUTIL}\n{PHASE_DHCP}\n{PHASE_EMS}\n{PHASE_COMPLETE}\n")).await.unwrap();
        let outcome = watch_serial_log(&log, Duration::from_secs(2), &ALL_PHASES).await.unwrap();
        assert!(outcome.completed_before_timeout);
        assert_eq!(outcome.phases_observed.len(), 5);
    }

    #[tokio::test]
    async fn watch_serial_log_times_out_without_complete() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("serial.log");
        tokio::fs::write(&log, format!("{PHASE_STARTING}\n")).await.unwrap();
        let outcome = watch_serial_log(&log, Duration::from_millis(300), &ALL_PHASES).await.unwrap();
        assert!(!outcome.completed_before_timeout);
    }
}
