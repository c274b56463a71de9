//! Error taxonomy for the monitor client and machine supervisor.

use serde_json::Value;
use thiserror::Error;

/// Result alias used across vmharness.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Coarse classification of a [`HarnessError`].
///
/// - `Transport`: socket level failures, never retried automatically
/// - `Protocol`: the peer broke the wire contract; the session is closed
/// - `Command`: the emulator answered with an error object; the session stays usable
/// - `Lifecycle`: misuse of the machine or monitor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Command,
    Lifecycle,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("capabilities error: {0}")]
    Capabilities(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("monitor closed")]
    MonitorClosed,

    /// The emulator replied with `{"error": {...}}`.
    #[error("command '{command}' failed ({class}): {desc}")]
    Command {
        command: String,
        class: String,
        desc: String,
        /// The complete `error` object as received.
        payload: Value,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Migration reported `failed`. Not completing in time is a `Timeout`.
    #[error("migration failed: {0}")]
    Migration(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            HarnessError::ConnectionRefused(_)
            | HarnessError::ConnectionReset(_)
            | HarnessError::Timeout(_)
            | HarnessError::Io(_) => ErrorCategory::Transport,
            HarnessError::MalformedData(_)
            | HarnessError::Connect(_)
            | HarnessError::Capabilities(_)
            | HarnessError::Protocol(_)
            | HarnessError::MonitorClosed => ErrorCategory::Protocol,
            HarnessError::Command { .. } => ErrorCategory::Command,
            HarnessError::InvalidState(_)
            | HarnessError::Launch(_)
            | HarnessError::InvalidArgument(_)
            | HarnessError::Migration(_)
            | HarnessError::Config(_)
            | HarnessError::Internal(_) => ErrorCategory::Lifecycle,
        }
    }

    /// Build a [`HarnessError::Command`] from the `error` member of a reply.
    ///
    /// Missing `class`/`desc` fields fall back to `"GenericError"` and the
    /// serialized payload respectively.
    pub fn command(command: impl Into<String>, payload: Value) -> Self {
        let class = payload
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("GenericError")
            .to_string();
        let desc = payload
            .get("desc")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());
        HarnessError::Command {
            command: command.into(),
            class,
            desc,
            payload,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout(_))
    }

    /// Map an I/O error from a socket operation onto the transport variants.
    pub fn from_io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::NotFound => {
                HarnessError::ConnectionRefused(format!("{}: {}", context, err))
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => {
                HarnessError::ConnectionReset(format!("{}: {}", context, err))
            }
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                HarnessError::Timeout(format!("{}: {}", context, err))
            }
            _ => HarnessError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;

    #[test]
    fn test_command_error_fields() {
        let err = HarnessError::command(
            "blockdev-add",
            json!({"class": "DeviceNotFound", "desc": "no such drive"}),
        );
        assert_eq!(err.category(), ErrorCategory::Command);
        match &err {
            HarnessError::Command { class, desc, .. } => {
                assert_eq!(class, "DeviceNotFound");
                assert_eq!(desc, "no such drive");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("blockdev-add"));
    }

    #[test]
    fn test_command_error_without_desc() {
        let err = HarnessError::command("stop", json!({"weird": 1}));
        match err {
            HarnessError::Command { class, desc, .. } => {
                assert_eq!(class, "GenericError");
                assert!(desc.contains("weird"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_io_mapping() {
        let refused = HarnessError::from_io("connect", io::ErrorKind::ConnectionRefused.into());
        assert!(matches!(refused, HarnessError::ConnectionRefused(_)));

        let reset = HarnessError::from_io("read", io::ErrorKind::BrokenPipe.into());
        assert!(matches!(reset, HarnessError::ConnectionReset(_)));

        let timeout = HarnessError::from_io("read", io::ErrorKind::TimedOut.into());
        assert!(timeout.is_timeout());
        assert_eq!(timeout.category(), ErrorCategory::Transport);

        let other = HarnessError::from_io("read", io::ErrorKind::PermissionDenied.into());
        assert!(matches!(other, HarnessError::Io(_)));
    }

    #[test]
    fn test_categories() {
        assert_eq!(HarnessError::MonitorClosed.category(), ErrorCategory::Protocol);
        assert_eq!(
            HarnessError::InvalidState("already launched".into()).category(),
            ErrorCategory::Lifecycle
        );
        assert_eq!(
            HarnessError::MalformedData("x".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            HarnessError::Migration("vm0".into()).category(),
            ErrorCategory::Lifecycle
        );
    }
}
