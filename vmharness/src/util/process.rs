//! Exit status interpretation for emulator processes.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Exit code with signals folded in as negative numbers (`-9` for SIGKILL).
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signo)) => -signo,
        (None, None) => i32::MIN,
    }
}

/// Signal number behind a negative [`exit_code`], if there is one.
pub fn exit_signal(code: i32) -> Option<i32> {
    code.checked_neg().filter(|signo| *signo > 0)
}

/// Symbolic name of a signal number, e.g. `SIGKILL`.
pub fn signal_name(signo: i32) -> String {
    Signal::try_from(signo)
        .map(|signal| signal.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", signo))
}

/// Human readable exit description for diagnostics.
pub fn describe_exit(status: ExitStatus) -> String {
    match status.signal() {
        Some(signo) => format!("killed by {}", signal_name(signo)),
        None => match status.code() {
            Some(code) => format!("exit code {}", code),
            None => "unknown exit status".to_string(),
        },
    }
}
