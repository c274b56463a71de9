//! One-shot emulator queries.
//!
//! ```text
//! tempdir ─▶ listen(unix sock) ─▶ spawn(-S -machine none) ─▶ accept
//!         ─▶ <command> ─▶ quit ─▶ reap ─▶ tempdir removed
//! ```

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use vmharness_shared::{Endpoint, HarnessError, HarnessResult};

use super::process::{EmulatorProcess, accept_monitor};
use crate::monitor::{DEFAULT_ACCEPT_TIMEOUT, MonitorClient, Reply};

/// Bound for the throwaway emulator to exit after `quit`.
const PROBE_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `command` against a throwaway emulator instance.
///
/// The instance is started paused with no devices and no machine, so this
/// works for any target the binary supports.
///
/// # Returns
///
/// * `Ok(Some(value))` - the command's return value
/// * `Ok(None)` - the binary could not be spawned, or the command failed
///
/// # Errors
///
/// Monitor protocol failures are returned as-is.
pub async fn execute_once(binary: &Path, command: &str) -> HarnessResult<Option<Value>> {
    let workdir = tempfile::Builder::new().prefix("vmharness-probe-").tempdir()?;
    let socket = workdir.path().join("probe-monitor.sock");
    let log = File::create(workdir.path().join("probe.log"))?;

    let mut monitor = MonitorClient::listen(Endpoint::unix(&socket)).await?;
    let argv = vec![
        binary.display().to_string(),
        "-nodefaults".to_string(),
        "-machine".to_string(),
        "none".to_string(),
        "-nographic".to_string(),
        "-S".to_string(),
        "-qmp".to_string(),
        monitor.endpoint().to_uri(),
    ];

    let mut process = match EmulatorProcess::spawn(&argv, log) {
        Ok(process) => process,
        Err(HarnessError::Launch(reason)) => {
            tracing::debug!(binary = %binary.display(), %reason, "Probe binary not runnable");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let result = query(&mut monitor, &mut process, command).await;
    monitor.close().await;

    if process.wait_timeout(PROBE_EXIT_TIMEOUT).await.is_err() {
        tracing::warn!(pid = process.pid(), "Probe emulator ignored quit, killing");
        process.kill()?;
        process.wait().await?;
    }

    workdir.close()?;
    result
}

async fn query(
    monitor: &mut MonitorClient,
    process: &mut EmulatorProcess,
    command: &str,
) -> HarnessResult<Option<Value>> {
    accept_monitor(monitor, process, DEFAULT_ACCEPT_TIMEOUT).await?;

    let reply = monitor.cmd(command, None).await?;
    // Nothing useful is lost if quit races with the exit.
    let _ = monitor.cmd("quit", None).await;

    match reply {
        Reply::Return(value) => Ok(Some(value)),
        Reply::Error(error) => {
            tracing::debug!(command, %error, "Probe command failed");
            Ok(None)
        }
    }
}

/// Target architecture of `binary`, from `query-target`.
///
/// `Ok(None)` when the binary cannot be spawned.
pub async fn probe_arch(binary: &Path) -> HarnessResult<Option<String>> {
    let target = execute_once(binary, "query-target").await?;
    Ok(target.and_then(|t| t.get("arch").and_then(Value::as_str).map(str::to_string)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let arch = probe_arch(&dir.path().join("no-such-emulator")).await.unwrap();
        assert!(arch.is_none());
    }

    #[tokio::test]
    async fn test_probe_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain-file");
        std::fs::write(&path, "not a program").unwrap();
        assert!(probe_arch(&path).await.unwrap().is_none());
    }
}
