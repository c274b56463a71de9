//! Process, logging and binary discovery helpers.

mod binary;
mod logging;
mod process;

pub use binary::{QEMU_BIN_ENV, find_emulator_binary};
pub use logging::{LOG_FILE_NAME, init_logging, init_logging_to};
pub use process::{describe_exit, exit_code, exit_signal, signal_name};
