//! Console and auxiliary character device wiring.
//!
//! Everything here only builds argument vectors; nothing is opened until
//! the machine launches.

use std::os::fd::RawFd;
use std::path::Path;

/// Console device used when an architecture has no table entry.
pub const DEFAULT_CONSOLE_DEVICE: &str = "isa-serial";

/// Chardev id of the automatic console.
pub const CONSOLE_CHARDEV_ID: &str = "console";

/// Console choice for an architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleDevice {
    /// The architecture gets no automatic console.
    NoConsole,
    /// Device type to attach the console chardev to.
    Device(String),
}

/// Preferred console device for `arch`.
///
/// s390x is deliberately absent: it supports a single operator console,
/// which `-nodefaults` alone does not free up.
pub fn console_device_for_arch(arch: Option<&str>) -> ConsoleDevice {
    match arch {
        Some(
            "xtensa" | "xtensaeb" | "hppa" | "microblaze" | "mips" | "mips64el" | "riscv64"
            | "sparc" | "i386" | "alpha" | "lm32" | "moxie" | "ppcemb",
        ) => ConsoleDevice::NoConsole,
        Some("ppc64") => ConsoleDevice::Device("spapr-vty".to_string()),
        _ => ConsoleDevice::Device(DEFAULT_CONSOLE_DEVICE.to_string()),
    }
}

/// Server-mode Unix socket chardev plus the console device bound to it.
///
/// Empty for [`ConsoleDevice::NoConsole`].
pub fn auto_console_args(device: &ConsoleDevice, socket: &Path) -> Vec<String> {
    match device {
        ConsoleDevice::NoConsole => Vec::new(),
        ConsoleDevice::Device(device_type) => vec![
            "-chardev".to_string(),
            format!(
                "socket,id={},path={},server,nowait",
                CONSOLE_CHARDEV_ID,
                socket.display()
            ),
            "-device".to_string(),
            format!("{},chardev={}", device_type, CONSOLE_CHARDEV_ID),
        ],
    }
}

/// An extra human monitor reachable over telnet. Useful to keep a monitor
/// slot busy or for interactive debugging.
pub fn telnet_monitor_args(host: &str, port: u16) -> Vec<String> {
    vec![
        "-monitor".to_string(),
        format!("tcp:{}:{},server,nowait,telnet", host, port),
    ]
}

/// Pass an inherited file descriptor into an fd set.
pub fn fd_args(fd: RawFd, fdset: u32, opaque: &str, opts: Option<&str>) -> Vec<String> {
    let mut options = vec![
        format!("fd={}", fd),
        format!("set={}", fdset),
        format!("opaque={}", opaque),
    ];
    if let Some(opts) = opts.filter(|o| !o.is_empty()) {
        options.push(opts.to_string());
    }
    vec!["-add-fd".to_string(), options.join(",")]
}
