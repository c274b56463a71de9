//! vmharness - drive emulator instances from tests.
//!
//! Two halves:
//!
//! - [`monitor`]: a client for the emulator's JSON control protocol (QMP).
//!   Handles the greeting and capabilities handshake, keeps command replies
//!   in order and queues asynchronous events that arrive in between.
//! - [`machine`]: launches an emulator with a monitor wired up, captures
//!   its output, and tears everything down again, diagnosing crashes.
//!
//! ```no_run
//! # async fn demo() -> vmharness::HarnessResult<()> {
//! use std::time::Duration;
//! use vmharness::{Machine, MachineOptions};
//!
//! vmharness::init_logging();
//! let mut vm = Machine::new(MachineOptions::new("qemu-system-x86_64").with_args(["-S"]));
//! vm.launch().await?;
//! vm.command("cont", None).await?;
//! vm.event_wait("RESUME", Duration::from_secs(5), None).await?;
//! vm.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod machine;
pub mod monitor;
pub mod ports;
pub mod util;

pub use machine::{
    ConsoleDevice, Machine, MachineOptions, MachineState, Termination, console_device_for_arch,
    execute_once, probe_arch,
};
pub use monitor::{Event, Greeting, MonitorClient, Reply, SessionState, Wait};
pub use ports::PortAllocator;
pub use util::{find_emulator_binary, init_logging, init_logging_to};
pub use vmharness_shared::{Endpoint, ErrorCategory, HarnessError, HarnessResult};
