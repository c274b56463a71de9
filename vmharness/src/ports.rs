//! TCP port bookkeeping for tests that need fixed ports (telnet monitors,
//! migration targets, TCP monitor sockets).

use std::collections::BTreeSet;
use std::net::TcpListener;

use parking_lot::Mutex;
use vmharness_shared::{HarnessError, HarnessResult};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_START_PORT: u16 = 5000;

/// Hands out ports that are neither retained by this allocator nor bound by
/// anyone else at the time of the check.
///
/// Share it by reference between machines that run side by side.
#[derive(Debug)]
pub struct PortAllocator {
    host: String,
    start_port: u16,
    retained: Mutex<BTreeSet<u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_START_PORT)
    }
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, start_port: u16) -> Self {
        Self {
            host: host.into(),
            start_port,
            retained: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Retain `port`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the port is already retained or currently bound.
    pub fn register_port(&self, port: u16) -> HarnessResult<()> {
        let mut retained = self.retained.lock();
        if retained.contains(&port) || !self.is_free(port) {
            return Err(HarnessError::InvalidArgument(format!(
                "port {} on {} is in use",
                port, self.host
            )));
        }
        retained.insert(port);
        Ok(())
    }

    /// Find and retain the first usable port at or above `start`
    /// (the allocator's start port by default).
    pub fn find_free_port(&self, start: Option<u16>) -> Option<u16> {
        let mut retained = self.retained.lock();
        let start = start.unwrap_or(self.start_port);
        let port = (start..=u16::MAX).find(|p| !retained.contains(p) && self.is_free(*p))?;
        retained.insert(port);
        tracing::debug!(host = %self.host, port, "Allocated port");
        Some(port)
    }

    pub fn release_port(&self, port: u16) {
        self.retained.lock().remove(&port);
    }

    pub fn is_retained(&self, port: u16) -> bool {
        self.retained.lock().contains(&port)
    }

    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((self.host.as_str(), port)).is_ok()
    }
}
