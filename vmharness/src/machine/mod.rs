//! Emulator process supervision.
//!
//! ## Lifecycle
//!
//! ```text
//!  Idle ──launch──▶ Launching ──monitor greeted──▶ Running ──shutdown/wait──▶ Stopped
//!                       │                                                       ▲  │
//!                       └──────────────────failure (cleanup)───────────────────┘  │
//!                                                                                 │
//!  Stopped ──launch──▶ Launching ... ◀────────────────────────────────────────────┘
//! ```
//!
//! Every launch gets a private working directory holding the monitor socket,
//! the console socket and the log file capturing the emulator's stdout and
//! stderr. The directory is removed when the machine stops, after the log has
//! been read into memory.

pub mod console;
pub mod options;
mod probe;
mod process;

pub use console::{ConsoleDevice, console_device_for_arch};
pub use options::{DEFAULT_SHUTDOWN_TIMEOUT, MachineOptions};
pub use probe::{execute_once, probe_arch};

use std::fs::File;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tokio::time::Instant;
use vmharness_shared::{Endpoint, HarnessError, HarnessResult};

use crate::monitor::{Connection, Event, MonitorClient, Reply, Wait, translate_keys};
use crate::ports::PortAllocator;
use crate::util::{exit_code, exit_signal, signal_name};
use console::{auto_console_args, fd_args, telnet_monitor_args};
use process::{EmulatorProcess, accept_monitor};

/// Chardev id of the control monitor.
const MONITOR_CHARDEV_ID: &str = "mon";

/// How often [`Machine::migrate`] asks for the migration status.
const MIGRATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    Launching,
    Running,
    Stopped,
}

/// How [`Machine::shutdown`] stopped the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The emulator exited after `quit`.
    Graceful,
    /// `quit` failed or timed out and the emulator was killed.
    Killed,
    /// There was no live emulator to stop.
    NotRunning,
}

/// A supervised emulator instance.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> vmharness_shared::HarnessResult<()> {
/// use vmharness::{Machine, MachineOptions};
///
/// let mut vm = Machine::new(MachineOptions::new("qemu-system-x86_64").with_args(["-S"]));
/// vm.launch().await?;
/// let status = vm.command("query-status", None).await?;
/// println!("{}", status["status"]);
/// vm.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Machine {
    name: String,
    options: MachineOptions,
    args: Vec<String>,
    arch: Option<String>,
    state: MachineState,
    workdir: Option<TempDir>,
    log_path: Option<PathBuf>,
    monitor: Option<MonitorClient>,
    process: Option<EmulatorProcess>,
    full_args: Vec<String>,
    iolog: Option<String>,
    exit_code: Option<i32>,
    console_address: Option<PathBuf>,
}

impl Machine {
    pub fn new(options: MachineOptions) -> Self {
        let name = options.name.clone().unwrap_or_else(options::generate_name);
        Self {
            name,
            args: options.args.clone(),
            arch: options.arch.clone(),
            options,
            state: MachineState::Idle,
            workdir: None,
            log_path: None,
            monitor: None,
            process: None,
            full_args: Vec::new(),
            iolog: None,
            exit_code: None,
            console_address: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Start the emulator and complete the monitor handshake.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the machine is already running
    /// - `Launch` if the binary cannot be started or exits before
    ///   connecting to the monitor
    /// - `Timeout` if the monitor is not connected within `accept_timeout`
    /// - monitor protocol errors from the handshake
    ///
    /// On failure everything is cleaned up; the command line and captured
    /// output are logged and remain available via [`full_args`](Self::full_args)
    /// and [`get_log`](Self::get_log).
    pub async fn launch(&mut self) -> HarnessResult<()> {
        if matches!(self.state, MachineState::Running | MachineState::Launching) {
            return Err(HarnessError::InvalidState(format!(
                "machine {} already launched",
                self.name
            )));
        }

        self.state = MachineState::Launching;
        self.iolog = None;
        self.exit_code = None;
        self.full_args.clear();

        match self.launch_inner().await {
            Ok(()) => {
                self.state = MachineState::Running;
                let pid = self.get_pid();
                tracing::info!(machine = %self.name, pid = ?pid, "Machine running");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup_err) = self.shutdown().await {
                    tracing::warn!(machine = %self.name, error = %cleanup_err, "Cleanup after failed launch failed");
                }
                tracing::error!(
                    machine = %self.name,
                    error = %e,
                    command = %self.full_args.join(" "),
                    output = %self.iolog.as_deref().unwrap_or(""),
                    "Error launching emulator"
                );
                Err(e)
            }
        }
    }

    async fn launch_inner(&mut self) -> HarnessResult<()> {
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{}-", self.name))
            .tempdir_in(&self.options.test_dir)?;
        let workdir_path = workdir.path().to_path_buf();
        self.workdir = Some(workdir);

        let log_path = workdir_path.join(format!("{}.log", self.name));
        let log = File::create(&log_path)?;
        self.log_path = Some(log_path);

        let endpoint = self.options.monitor_address.clone().unwrap_or_else(|| {
            Endpoint::unix(workdir_path.join(format!("{}-monitor.sock", self.name)))
        });
        let mut monitor = MonitorClient::listen(endpoint).await?;

        let auto_args = if self.options.automatic_devices {
            self.automatic_args(&workdir_path).await?
        } else {
            Vec::new()
        };
        self.full_args = self.command_line(monitor.endpoint(), auto_args);

        tracing::debug!(
            machine = %self.name,
            command = %self.full_args.join(" "),
            "Launching emulator"
        );
        let process = self.process.insert(EmulatorProcess::spawn(&self.full_args, log)?);

        let greeting = accept_monitor(&mut monitor, process, self.options.accept_timeout).await?;
        tracing::debug!(
            machine = %self.name,
            version = ?greeting.emulator_version(),
            "Monitor connected"
        );
        self.monitor = Some(monitor);
        Ok(())
    }

    /// `-nodefaults` plus the architecture's console, probing the binary for
    /// its architecture when none was configured.
    async fn automatic_args(&mut self, workdir: &Path) -> HarnessResult<Vec<String>> {
        if self.arch.is_none() {
            self.arch = probe_arch(&self.options.binary).await?;
            tracing::debug!(machine = %self.name, arch = ?self.arch, "Probed architecture");
        }

        let mut args = vec!["-nodefaults".to_string()];
        let device = console_device_for_arch(self.arch.as_deref());
        if device != ConsoleDevice::NoConsole {
            let socket = workdir.join(format!("{}-console.sock", self.name));
            args.extend(auto_console_args(&device, &socket));
            self.console_address = Some(socket);
        }
        Ok(args)
    }

    fn command_line(&self, monitor: &Endpoint, auto_args: Vec<String>) -> Vec<String> {
        let mut argv = self.options.wrapper.clone();
        argv.push(self.options.binary.display().to_string());
        argv.extend(base_args(monitor));
        argv.extend(auto_args);
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Stop the emulator and release everything the launch created.
    ///
    /// Sends `quit` and waits up to `shutdown_timeout`; kills the emulator if
    /// that fails. Then reaps it, reads the log and removes the working
    /// directory. An exit by signal is logged as a warning, not returned.
    /// Calling this on a machine that never launched, or twice, is fine.
    pub async fn shutdown(&mut self) -> HarnessResult<Termination> {
        let running = self.process.as_mut().is_some_and(|p| p.is_running());
        let termination = if running {
            self.terminate().await?
        } else {
            Termination::NotRunning
        };

        self.cleanup().await?;
        Ok(termination)
    }

    async fn terminate(&mut self) -> HarnessResult<Termination> {
        let timeout = self.options.shutdown_timeout;

        if let Some(monitor) = self.monitor.as_mut().filter(|m| m.is_greeted()) {
            monitor.set_command_timeout(Some(timeout));
            let quit = monitor.cmd("quit", None).await;
            monitor.close().await;

            match quit {
                Ok(_) => {
                    if let Some(process) = self.process.as_mut() {
                        match process.wait_timeout(timeout).await {
                            Ok(_) => return Ok(Termination::Graceful),
                            Err(e) => tracing::warn!(machine = %self.name, error = %e, "Emulator ignored quit"),
                        }
                    }
                }
                Err(e) => tracing::debug!(machine = %self.name, error = %e, "quit failed"),
            }
        }

        let Some(process) = self.process.as_mut() else {
            return Ok(Termination::NotRunning);
        };
        if !process.is_running() {
            return Ok(Termination::Graceful);
        }
        tracing::warn!(machine = %self.name, pid = process.pid(), "Killing emulator");
        process.kill()?;
        Ok(Termination::Killed)
    }

    /// Reap the child, close the monitor, read the log, remove the working
    /// directory.
    async fn cleanup(&mut self) -> HarnessResult<()> {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.close().await;
        }

        let reaped = match self.process.take() {
            Some(mut process) => Some(process.wait().await?),
            None => None,
        };

        self.load_log();
        self.log_path = None;
        self.console_address = None;
        if let Some(workdir) = self.workdir.take() {
            workdir.close()?;
        }

        if let Some(status) = reaped {
            let code = exit_code(status);
            self.exit_code = Some(code);
            match exit_signal(code) {
                Some(signo) => tracing::warn!(
                    machine = %self.name,
                    signal = %signal_name(signo),
                    command = %self.full_args.join(" "),
                    "Emulator received signal"
                ),
                None => tracing::debug!(machine = %self.name, exit_code = code, "Emulator exited"),
            }
        }

        if self.state != MachineState::Idle {
            self.state = MachineState::Stopped;
        }
        Ok(())
    }

    fn load_log(&mut self) {
        let Some(path) = self.log_path.as_ref() else {
            return;
        };
        match std::fs::read(path) {
            Ok(bytes) => self.iolog = Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => tracing::warn!(machine = %self.name, error = %e, "Could not read emulator log"),
        }
    }

    /// Wait for the emulator to exit on its own, then clean up.
    ///
    /// # Errors
    ///
    /// `Timeout` if it is still running after `timeout`; the machine is left
    /// untouched in that case.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> HarnessResult<()> {
        if let Some(process) = self.process.as_mut() {
            match timeout {
                Some(limit) => process.wait_timeout(limit).await?,
                None => process.wait().await?,
            };
        }
        self.cleanup().await
    }

    /// Whether the emulator process is alive. Never blocks.
    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(|p| p.is_running())
    }

    /// Alive with a usable monitor session.
    pub fn is_operational(&mut self) -> bool {
        self.is_running() && self.monitor.as_ref().is_some_and(|m| m.is_greeted())
    }

    /// PID of the live emulator. `None` once it has exited, even before
    /// the machine is shut down.
    pub fn get_pid(&mut self) -> Option<u32> {
        self.process
            .as_mut()
            .and_then(|p| if p.is_running() { Some(p.pid()) } else { None })
    }

    /// Exit code of the last run; negative for a signal (`-9` for SIGKILL).
    pub fn exitcode(&self) -> Option<i32> {
        self.exit_code
    }

    /// Emulator output of the last run, available once it stopped.
    pub fn get_log(&self) -> Option<&str> {
        self.iolog.as_deref()
    }

    /// Command line of the last launch.
    pub fn full_args(&self) -> &[String] {
        &self.full_args
    }

    pub fn arch(&self) -> Option<&str> {
        self.arch.as_deref()
    }

    /// Console socket of the running machine, if automatic devices added one.
    pub fn console_address(&self) -> Option<&Path> {
        self.console_address.as_deref()
    }

    /// Connect to the automatic console.
    pub async fn open_console(&self) -> HarnessResult<Connection> {
        let socket = self.console_address.as_ref().ok_or_else(|| {
            HarnessError::InvalidState(format!("machine {} has no console", self.name))
        })?;
        Connection::connect(&Endpoint::unix(socket)).await
    }

    fn monitor(&mut self) -> HarnessResult<&mut MonitorClient> {
        let name = &self.name;
        self.monitor
            .as_mut()
            .ok_or_else(|| HarnessError::InvalidState(format!("machine {} is not running", name)))
    }

    /// Run a command and return its `return` value.
    pub async fn command(
        &mut self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> HarnessResult<Value> {
        self.monitor()?.command(name, arguments).await
    }

    /// Run a command with `snake_case` argument names translated to the
    /// monitor's `kebab-case`. Error replies are returned, not raised.
    pub async fn qmp(&mut self, name: &str, arguments: Map<String, Value>) -> HarnessResult<Reply> {
        let arguments = Some(translate_keys(arguments)).filter(|a| !a.is_empty());
        self.monitor()?.cmd(name, arguments).await
    }

    /// Like [`qmp`](Self::qmp) but sends argument names untouched.
    pub async fn qmp_verbatim(
        &mut self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> HarnessResult<Reply> {
        self.monitor()?.cmd(name, arguments).await
    }

    pub async fn get_qmp_event(&mut self, wait: Wait) -> HarnessResult<Option<Event>> {
        self.monitor()?.pull_event(wait).await
    }

    pub async fn get_qmp_events(&mut self, wait: Wait) -> HarnessResult<Vec<Event>> {
        self.monitor()?.get_events(wait).await
    }

    pub async fn event_wait(
        &mut self,
        name: &str,
        timeout: Duration,
        pattern: Option<&Value>,
    ) -> HarnessResult<Event> {
        self.monitor()?.event_wait(name, timeout, pattern).await
    }

    /// Run a human monitor command line and return its text output.
    pub async fn human_monitor_command(&mut self, command_line: &str) -> HarnessResult<String> {
        let mut arguments = Map::new();
        arguments.insert("command-line".to_string(), json!(command_line));
        let output = self
            .command("human-monitor-command", Some(arguments))
            .await?;
        Ok(output.as_str().unwrap_or_default().to_string())
    }

    /// Live-migrate this machine into a new destination machine.
    ///
    /// The destination runs the same binary, architecture and arguments plus
    /// `-incoming tcp:0:<port>`, with the port taken from `ports`. It gets its
    /// own name, working directory and monitor socket.
    ///
    /// ```text
    ///  source                                  destination
    ///    │                                          │ launch -incoming tcp:0:P
    ///    │── migrate -d tcp:0:P ───────────────────▶│
    ///    │── info migrate (poll) ──▶ completed / failed / timeout
    /// ```
    ///
    /// # Errors
    ///
    /// - `InvalidState` if this machine is not running
    /// - `InvalidArgument` if `ports` has no free port left
    /// - `Migration` if the emulator reports the migration as failed
    /// - `Timeout` if it has not completed within `timeout`
    ///
    /// The destination is shut down on any error after its launch.
    pub async fn migrate(&mut self, ports: &PortAllocator, timeout: Duration) -> HarnessResult<Machine> {
        self.monitor()?;
        let port = ports.find_free_port(None).ok_or_else(|| {
            HarnessError::InvalidArgument(format!("no free port on {}", ports.host()))
        })?;

        let mut options = self.options.clone();
        options.name = None;
        options.monitor_address = None;
        options.arch = self.arch.clone();
        options.args = without_option(&self.args, "-incoming");
        let mut destination = Machine::new(options);
        destination.add_incoming(port);

        tracing::info!(
            machine = %self.name,
            destination = %destination.name,
            port,
            "Starting migration"
        );
        let result = match destination.launch().await {
            Ok(()) => self.await_migration(port, timeout).await,
            Err(e) => Err(e),
        };
        ports.release_port(port);

        match result {
            Ok(()) => Ok(destination),
            Err(e) => {
                if let Err(cleanup_err) = destination.shutdown().await {
                    tracing::warn!(machine = %destination.name, error = %cleanup_err, "Destination cleanup failed");
                }
                Err(e)
            }
        }
    }

    async fn await_migration(&mut self, port: u16, timeout: Duration) -> HarnessResult<()> {
        self.human_monitor_command(&format!("migrate -d tcp:0:{}", port))
            .await?;

        let deadline = Instant::now() + timeout;
        loop {
            let status = self.human_monitor_command("info migrate").await?;
            if status.contains("completed") {
                tracing::info!(machine = %self.name, "Migration successful");
                return Ok(());
            }
            if status.contains("failed") {
                return Err(HarnessError::Migration(format!(
                    "migration of {} failed",
                    self.name
                )));
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::Timeout(format!(
                    "migration of {} did not complete after {:?}",
                    self.name, timeout
                )));
            }
            tokio::time::sleep(MIGRATION_POLL_INTERVAL).await;
        }
    }

    /// Append user arguments for the next launch.
    pub fn add_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pass inherited descriptor `fd` into fd set `fdset`.
    pub fn add_fd(&mut self, fd: RawFd, fdset: u32, opaque: &str, opts: Option<&str>) -> &mut Self {
        self.add_args(fd_args(fd, fdset, opaque, opts))
    }

    pub fn add_monitor_telnet(&mut self, host: &str, port: u16) -> &mut Self {
        self.add_args(telnet_monitor_args(host, port))
    }

    /// Add `-machine <type>[,accel=..][,kvm-type=..]`.
    ///
    /// Called with nothing to set, logs an error and adds nothing.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a `-machine` option is already present.
    pub fn add_machine(
        &mut self,
        machine_type: Option<&str>,
        accel: Option<&str>,
        kvm_type: Option<&str>,
    ) -> HarnessResult<&mut Self> {
        if self.args.iter().any(|a| a == "-machine") {
            tracing::error!(machine = %self.name, "Option -machine already present");
            return Err(HarnessError::InvalidArgument("option -machine already present".into()));
        }

        let mut options: Vec<String> = Vec::new();
        options.extend(machine_type.map(str::to_string));
        options.extend(accel.map(|a| format!("accel={}", a)));
        options.extend(kvm_type.map(|k| format!("kvm-type={}", k)));
        if options.is_empty() {
            tracing::error!(machine = %self.name, "Option -machine needs an argument");
            return Ok(self);
        }

        Ok(self.add_args(["-machine".to_string(), options.join(",")]))
    }

    /// Add `-drive file=<path>[,extra][,snapshot=on]`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a drive for `path` is already present.
    pub fn add_drive(
        &mut self,
        path: &Path,
        snapshot: bool,
        extra: Option<&str>,
    ) -> HarnessResult<&mut Self> {
        let mut option = format!("file={}", path.display());
        if self.args.iter().any(|a| a.contains(&option)) {
            tracing::error!(machine = %self.name, path = %path.display(), "Drive already present");
            return Err(HarnessError::InvalidArgument(format!(
                "drive {} already present",
                path.display()
            )));
        }

        if let Some(extra) = extra.filter(|e| !e.is_empty()) {
            option.push(',');
            option.push_str(extra);
        }
        if snapshot {
            option.push_str(",snapshot=on");
        }
        Ok(self.add_args(["-drive".to_string(), option]))
    }

    /// Make this machine a migration destination listening on `port`.
    pub fn add_incoming(&mut self, port: u16) -> &mut Self {
        self.add_args(["-incoming".to_string(), format!("tcp:0:{}", port)])
    }
}

/// `args` minus every occurrence of `option` and its value.
fn without_option(args: &[String], option: &str) -> Vec<String> {
    let mut kept = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == option {
            iter.next();
        } else {
            kept.push(arg.clone());
        }
    }
    kept
}

/// Monitor wiring and display suppression every launch gets.
fn base_args(monitor: &Endpoint) -> Vec<String> {
    vec![
        "-chardev".to_string(),
        monitor.chardev_spec(MONITOR_CHARDEV_ID),
        "-mon".to_string(),
        format!("chardev={},mode=control", MONITOR_CHARDEV_ID),
        "-display".to_string(),
        "none".to_string(),
        "-vga".to_string(),
        "none".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine::new(MachineOptions::new("/usr/bin/qemu-system-x86_64").with_name("vm0"))
    }

    #[test]
    fn test_base_args() {
        assert_eq!(
            base_args(&Endpoint::unix("/tmp/vm0-monitor.sock")),
            [
                "-chardev",
                "socket,id=mon,path=/tmp/vm0-monitor.sock",
                "-mon",
                "chardev=mon,mode=control",
                "-display",
                "none",
                "-vga",
                "none",
            ]
        );
        assert_eq!(
            base_args(&Endpoint::tcp("127.0.0.1", 4444))[1],
            "socket,id=mon,host=127.0.0.1,port=4444"
        );
    }

    #[test]
    fn test_command_line_order() {
        let mut vm = Machine::new(
            MachineOptions::new("qemu")
                .with_wrapper(["strace", "-f"])
                .with_args(["-m", "256"]),
        );
        vm.add_args(["-S"]);

        let argv = vm.command_line(&Endpoint::unix("/tmp/m.sock"), vec!["-nodefaults".into()]);
        assert_eq!(&argv[..3], ["strace", "-f", "qemu"]);
        assert_eq!(argv[3], "-chardev");
        let auto = argv.iter().position(|a| a == "-nodefaults").unwrap();
        let user = argv.iter().position(|a| a == "-m").unwrap();
        assert!(auto < user);
        assert_eq!(&argv[argv.len() - 3..], ["-m", "256", "-S"]);
    }

    #[test]
    fn test_add_machine() {
        let mut vm = machine();
        vm.add_machine(None, None, None).unwrap();
        assert!(vm.args.is_empty());

        vm.add_machine(Some("pc"), Some("kvm"), Some("PR")).unwrap();
        assert_eq!(vm.args, ["-machine", "pc,accel=kvm,kvm-type=PR"]);

        let err = vm.add_machine(Some("q35"), None, None).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidArgument(_)));
        assert_eq!(vm.args.len(), 2);
    }

    #[test]
    fn test_add_drive() {
        let mut vm = machine();
        vm.add_drive(Path::new("/images/a.qcow2"), true, Some("if=virtio"))
            .unwrap();
        vm.add_drive(Path::new("/images/b.raw"), false, None).unwrap();
        assert_eq!(
            vm.args,
            [
                "-drive",
                "file=/images/a.qcow2,if=virtio,snapshot=on",
                "-drive",
                "file=/images/b.raw",
            ]
        );

        let err = vm
            .add_drive(Path::new("/images/a.qcow2"), true, None)
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidArgument(_)));
    }

    #[test]
    fn test_other_mutators() {
        let mut vm = machine();
        vm.add_fd(5, 2, "disk", None)
            .add_monitor_telnet("127.0.0.1", 4555)
            .add_incoming(5001);
        assert_eq!(
            vm.args,
            [
                "-add-fd",
                "fd=5,set=2,opaque=disk",
                "-monitor",
                "tcp:127.0.0.1:4555,server,nowait,telnet",
                "-incoming",
                "tcp:0:5001",
            ]
        );
    }

    #[test]
    fn test_without_option() {
        let args: Vec<String> = ["-m", "256", "-incoming", "tcp:0:5000", "-S"]
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(without_option(&args, "-incoming"), ["-m", "256", "-S"]);
        assert_eq!(without_option(&args, "-smp"), args);
    }

    #[tokio::test]
    async fn test_migrate_requires_running_machine() {
        let mut vm = machine();
        let ports = PortAllocator::new("127.0.0.1", 26000);
        let err = vm.migrate(&ports, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_not_launched() {
        let mut vm = machine();
        assert_eq!(vm.state(), MachineState::Idle);
        assert!(!vm.is_running());
        assert!(!vm.is_operational());
        assert!(vm.get_pid().is_none());
        assert!(matches!(
            vm.command("query-status", None).await,
            Err(HarnessError::InvalidState(_))
        ));
        assert!(matches!(vm.open_console().await, Err(HarnessError::InvalidState(_))));

        assert_eq!(vm.shutdown().await.unwrap(), Termination::NotRunning);
        assert_eq!(vm.shutdown().await.unwrap(), Termination::NotRunning);
        assert_eq!(vm.state(), MachineState::Idle);
        assert!(vm.exitcode().is_none());
    }

    #[tokio::test]
    async fn test_launch_missing_binary_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = Machine::new(
            MachineOptions::new(dir.path().join("missing-emulator"))
                .with_name("gone")
                .with_test_dir(dir.path()),
        );

        let err = vm.launch().await.unwrap_err();
        assert!(matches!(err, HarnessError::Launch(_)));
        assert_eq!(vm.state(), MachineState::Stopped);
        assert!(vm.full_args().iter().any(|a| a == "-mon"));
        assert_eq!(vm.get_log(), Some(""));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
