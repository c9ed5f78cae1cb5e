// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A single place every adapter and engine shells out through: command
//! logging with secret redaction, a wall-clock timeout, and an optional
//! stderr-regex progress hook (§5 "ProcRunner").
//!
//! Every external tool this crate invokes — `qemu-img`, `virt-customize`,
//! `virt-v2v`, `guestfish`, `nbdkit`, `mkisofs` — goes through [`run`].
//! Nothing upstream calls [`tokio::process::Command`] directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Result of a finished command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// How to run a command: streamed-with-progress, captured, or
/// fire-and-forget with inherited stdio (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Capture stdout/stderr as strings; don't stream to the terminal.
    Capture,
    /// Stream stderr line-by-line looking for `progress_pattern`, still
    /// collecting it for the final result.
    Progress,
    /// Inherit the parent's stdio; the returned strings are empty.
    Inherit,
}

/// One external command invocation, configured once and run with [`run`].
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub check: bool,
    pub mode: OutputMode,
    pub progress_pattern: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            cwd: None,
            timeout: None,
            check: true,
            mode: OutputMode::Capture,
            progress_pattern: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn progress_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.progress_pattern = Some(pattern.into());
        self.mode = OutputMode::Progress;
        self
    }

    fn full_command_for_log(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(redact_sensitive(&self.args));
        parts.join(" ")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("command timed out after {timeout:?}: {cmd}")]
    Timeout { cmd: String, timeout: Duration },
    #[error("command failed ({cmd}): {message}")]
    Failed { cmd: String, message: String },
    #[error("I/O error running {cmd}: {source}")]
    Io {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid progress pattern: {0}")]
    BadPattern(#[from] regex::Error),
}

/// Run `spec`, returning its output or a typed [`ProcError`]. When
/// `spec.check` is set (the default) a non-zero exit becomes
/// `ProcError::Failed`.
#[tracing::instrument(skip(spec), fields(cmd = %spec.full_command_for_log()))]
pub async fn run(spec: &CommandSpec, progress: Option<&mut dyn FnMut(f64)>) -> Result<CommandOutput, ProcError> {
    let log_cmd = spec.full_command_for_log();
    tracing::debug!("running: {log_cmd}");

    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    for (k, v) in &spec.env {
        command.env(k, v);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let output = match spec.mode {
        OutputMode::Capture => {
            command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
            run_capture(&mut command, spec, &log_cmd).await?
        }
        OutputMode::Progress => {
            let pattern = spec
                .progress_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()?
                .expect("OutputMode::Progress requires progress_pattern");
            command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
            run_with_progress(&mut command, spec, &log_cmd, &pattern, progress).await?
        }
        OutputMode::Inherit => {
            command.stdin(Stdio::null()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
            run_inherit(&mut command, spec, &log_cmd).await?
        }
    };

    if spec.check && !output.success() {
        let message = if output.stderr.trim().is_empty() {
            format!("exit code {}", output.status)
        } else {
            output.stderr.trim().to_string()
        };
        return Err(ProcError::Failed { cmd: log_cmd, message });
    }

    Ok(output)
}

async fn with_timeout<T>(
    spec: &CommandSpec,
    cmd: &str,
    fut: impl std::future::Future<Output = Result<T, std::io::Error>>,
) -> Result<T, ProcError> {
    let io_result = match spec.timeout {
        Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| ProcError::Timeout {
            cmd: cmd.to_string(),
            timeout: d,
        })?,
        None => fut.await,
    };
    io_result.map_err(|e| map_io_error(e, &spec.program, cmd))
}

fn map_io_error(e: std::io::Error, program: &str, cmd: &str) -> ProcError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ProcError::NotFound(program.to_string())
    } else {
        ProcError::Io { cmd: cmd.to_string(), source: e }
    }
}

async fn run_capture(command: &mut Command, spec: &CommandSpec, cmd: &str) -> Result<CommandOutput, ProcError> {
    let fut = async {
        let out = command.output().await?;
        Ok(CommandOutput {
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    };
    with_timeout(spec, cmd, fut).await
}

async fn run_inherit(command: &mut Command, spec: &CommandSpec, cmd: &str) -> Result<CommandOutput, ProcError> {
    let fut = async {
        let status = command.status().await?;
        Ok(CommandOutput { status: status.code().unwrap_or(-1), stdout: String::new(), stderr: String::new() })
    };
    with_timeout(spec, cmd, fut).await
}

async fn run_with_progress(
    command: &mut Command,
    spec: &CommandSpec,
    cmd: &str,
    pattern: &Regex,
    mut progress: Option<&mut dyn FnMut(f64)>,
) -> Result<CommandOutput, ProcError> {
    let fut = async {
        let mut child = command.spawn()?;
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");

        let mut reader = BufReader::new(stderr).lines();
        let mut stderr_buf = String::new();
        while let Some(line) = reader.next_line().await? {
            stderr_buf.push_str(&line);
            stderr_buf.push('\n');
            if let Some(caps) = pattern.captures(&line) {
                if let Some(pct) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
                    if let Some(cb) = progress.as_deref_mut() {
                        cb(pct);
                    }
                }
            }
        }

        let mut stdout_buf = String::new();
        stdout_pipe.read_to_string(&mut stdout_buf).await.ok();

        let status = child.wait().await?;
        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout: stdout_buf,
            stderr: stderr_buf,
        })
    };
    with_timeout(spec, cmd, fut).await
}

/// Whether `tool` resolves on `PATH`.
pub fn tool_available(tool: &str) -> bool {
    which::which(tool).is_ok()
}

/// The tools this crate's adapters shell out to, with a human description
/// (§5 "verify_required_tools").
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("qemu-img", "disk conversion (VMDK to qcow2)"),
    ("virt-customize", "guest OS modification"),
    ("virt-v2v", "VM conversion (optional, in-place BIOS-to-UEFI)"),
    ("guestfish", "guest filesystem access"),
    ("guestmount", "guest filesystem mounting"),
    ("nbdkit", "NBD server (optional, streaming export)"),
];

/// Check every tool in [`REQUIRED_TOOLS`], returning availability per name.
pub fn verify_required_tools() -> Vec<(&'static str, &'static str, bool)> {
    REQUIRED_TOOLS
        .iter()
        .map(|(tool, desc)| (*tool, *desc, tool_available(tool)))
        .collect()
}

const SENSITIVE_KEYS: &[&str] = &["password", "pwd", "secret", "token", "key"];

/// Redact password/secret-looking arguments before they hit a log line.
/// Handles both `--flag=value` and `--flag value` forms, matching the
/// original subprocess wrapper's heuristic.
pub fn redact_sensitive(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut skip_next = false;
    for (i, arg) in args.iter().enumerate() {
        if skip_next {
            out.push("[REDACTED]".to_string());
            skip_next = false;
            continue;
        }
        let lower = arg.to_lowercase();
        let looks_sensitive = SENSITIVE_KEYS.iter().any(|k| lower.contains(k));
        if looks_sensitive && arg.contains('=') {
            let key = arg.split('=').next().unwrap_or(arg);
            out.push(format!("{key}=[REDACTED]"));
        } else if looks_sensitive && i + 1 < args.len() {
            out.push(arg.clone());
            skip_next = true;
        } else {
            out.push(arg.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn redacts_equals_form() {
        let args = s(&["--password=hunter2", "--host", "10.0.0.1"]);
        let redacted = redact_sensitive(&args);
        assert_eq!(redacted[0], "--password=[REDACTED]");
        assert_eq!(redacted[2], "10.0.0.1");
    }

    #[test]
    fn redacts_space_separated_form() {
        let args = s(&["--token", "abc123", "--zone", "fr-par-1"]);
        let redacted = redact_sensitive(&args);
        assert_eq!(redacted[0], "--token");
        assert_eq!(redacted[1], "[REDACTED]");
        assert_eq!(redacted[2], "--zone");
    }

    #[test]
    fn leaves_ordinary_args_alone() {
        let args = s(&["-O", "qcow2", "src.vmdk", "dst.qcow2"]);
        assert_eq!(redact_sensitive(&args), args);
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let spec = CommandSpec::new("true", Vec::<String>::new());
        let out = run(&spec, None).await.unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_when_check_set() {
        let spec = CommandSpec::new("false", Vec::<String>::new());
        let err = run(&spec, None).await.unwrap_err();
        assert!(matches!(err, ProcError::Failed { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_is_ok_when_check_disabled() {
        let spec = CommandSpec::new("false", Vec::<String>::new()).check(false);
        let out = run(&spec, None).await.unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn missing_binary_reports_not_found() {
        let spec = CommandSpec::new("definitely-not-a-real-tool-xyz", Vec::<String>::new());
        let err = run(&spec, None).await.unwrap_err();
        assert!(matches!(err, ProcError::NotFound(_)));
    }

    #[tokio::test]
    async fn progress_pattern_invokes_callback() {
        let spec = CommandSpec::new("sh", s(&["-c", "echo '42.0% done' 1>&2"]))
            .progress_pattern(r"([\d.]+)% done");
        let mut seen = Vec::new();
        let mut cb = |pct: f64| seen.push(pct);
        let out = run(&spec, Some(&mut cb)).await.unwrap();
        assert!(out.success());
        assert_eq!(seen, vec![42.0]);
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let spec = CommandSpec::new("sleep", s(&["5"])).timeout(Duration::from_millis(50));
        let err = run(&spec, None).await.unwrap_err();
        assert!(matches!(err, ProcError::Timeout { .. }));
    }
}
