//! Machine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use vmharness_shared::Endpoint;

use crate::monitor::DEFAULT_ACCEPT_TIMEOUT;

/// How long `shutdown()` waits for the emulator to honour `quit`.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for a [`Machine`](super::Machine).
///
/// Nothing here touches the filesystem or spawns anything until
/// `launch()` is called.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineOptions {
    /// Emulator binary.
    pub binary: PathBuf,
    /// User arguments, appended after base and automatic arguments.
    pub args: Vec<String>,
    /// Command prefix, e.g. `["valgrind", "--quiet"]`.
    pub wrapper: Vec<String>,
    /// Prefix for socket, log and working directory names.
    /// Defaults to `qemu-<8 hex digits>`.
    pub name: Option<String>,
    /// Parent of the per-launch working directory.
    pub test_dir: PathBuf,
    /// Monitor address. Defaults to a Unix socket inside the working directory.
    pub monitor_address: Option<Endpoint>,
    /// Target architecture, e.g. `x86_64`. Probed from the binary when unset
    /// and `automatic_devices` is enabled.
    pub arch: Option<String>,
    /// Add `-nodefaults` and an architecture specific console.
    pub automatic_devices: bool,
    /// Bound for the emulator to connect to the monitor after spawn.
    pub accept_timeout: Duration,
    /// Bound for a graceful `quit` before falling back to kill.
    pub shutdown_timeout: Duration,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(format!("qemu-system-{}", std::env::consts::ARCH)),
            args: Vec::new(),
            wrapper: Vec::new(),
            name: None,
            test_dir: std::env::temp_dir(),
            monitor_address: None,
            arch: None,
            automatic_devices: false,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl MachineOptions {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_wrapper<I, S>(mut self, wrapper: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wrapper = wrapper.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_test_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.test_dir = dir.into();
        self
    }

    pub fn with_monitor_address(mut self, endpoint: Endpoint) -> Self {
        self.monitor_address = Some(endpoint);
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_automatic_devices(mut self, enabled: bool) -> Self {
        self.automatic_devices = enabled;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Generate a default machine name.
pub(crate) fn generate_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("qemu-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = MachineOptions::new("/usr/bin/qemu-system-x86_64");
        assert_eq!(options.binary, PathBuf::from("/usr/bin/qemu-system-x86_64"));
        assert!(options.args.is_empty());
        assert!(!options.automatic_devices);
        assert_eq!(options.accept_timeout, DEFAULT_ACCEPT_TIMEOUT);
        assert_eq!(options.test_dir, std::env::temp_dir());
    }

    #[test]
    fn test_builder() {
        let options = MachineOptions::new("qemu")
            .with_args(["-m", "512"])
            .with_args(vec![String::from("-smp"), String::from("2")])
            .with_wrapper(["strace", "-f"])
            .with_name("vm0")
            .with_arch("ppc64")
            .with_automatic_devices(true);
        assert_eq!(options.args, ["-m", "512", "-smp", "2"]);
        assert_eq!(options.wrapper, ["strace", "-f"]);
        assert_eq!(options.name.as_deref(), Some("vm0"));
        assert_eq!(options.arch.as_deref(), Some("ppc64"));
        assert!(options.automatic_devices);
    }

    #[test]
    fn test_deserialize_partial() {
        let options: MachineOptions = serde_json::from_str(
            r#"{"binary": "/opt/qemu", "monitor_address": {"tcp": {"host": "127.0.0.1", "port": 4444}}}"#,
        )
        .unwrap();
        assert_eq!(options.binary, PathBuf::from("/opt/qemu"));
        assert_eq!(options.monitor_address, Some(Endpoint::tcp("127.0.0.1", 4444)));
        assert_eq!(options.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[test]
    fn test_generate_name() {
        let name = generate_name();
        assert!(name.starts_with("qemu-"));
        assert_eq!(name.len(), "qemu-".len() + 8);
        assert_ne!(name, generate_name());
    }
}
