//! Emulator child process handle.

use std::fs::File;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use vmharness_shared::{HarnessError, HarnessResult};

use crate::monitor::{Greeting, MonitorClient};
use crate::util::describe_exit;

/// A spawned emulator.
///
/// The child is killed if the handle is dropped while it still runs.
#[derive(Debug)]
pub struct EmulatorProcess {
    child: Child,
    pid: u32,
}

impl EmulatorProcess {
    /// Spawn `argv[0]` with the remaining arguments.
    ///
    /// stdin is the null device; stdout and stderr both go to `log`.
    ///
    /// # Errors
    ///
    /// `HarnessError::Launch` if the program cannot be started at all
    /// (missing, not executable, ...).
    pub fn spawn(argv: &[String], log: File) -> HarnessResult<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarnessError::InvalidArgument("empty command line".into()))?;

        let stderr = log.try_clone()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            let err_msg = format!("Failed to spawn emulator at {}: {}", program, e);
            tracing::debug!("{}", err_msg);
            HarnessError::Launch(err_msg)
        })?;
        let pid = child
            .id()
            .ok_or_else(|| HarnessError::Internal("spawned child has no pid".into()))?;

        tracing::debug!(pid, program = %program, "Spawned emulator");
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness check.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the child to exit. Cancellation safe.
    pub async fn wait(&mut self) -> HarnessResult<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Wait at most `timeout` for the child to exit.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> HarnessResult<ExitStatus> {
        let pid = self.pid;
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| {
                HarnessError::Timeout(format!("process {} still running after {:?}", pid, timeout))
            })?
    }

    /// Send SIGKILL. Succeeds if the child already exited.
    pub fn kill(&mut self) -> HarnessResult<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(_) if !self.is_running() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Accept the emulator's monitor connection, failing early if the emulator
/// exits before it connects.
pub(crate) async fn accept_monitor(
    monitor: &mut MonitorClient,
    process: &mut EmulatorProcess,
    timeout: Duration,
) -> HarnessResult<Greeting> {
    tokio::select! {
        accepted = monitor.accept(Some(timeout)) => accepted,
        status = process.wait() => {
            let status = status?;
            Err(HarnessError::Launch(format!(
                "emulator exited before connecting to the monitor ({})",
                describe_exit(status)
            )))
        }
    }
}
