//! Socket addresses for monitor and console channels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a monitor (or auxiliary character device) socket lives.
///
/// Immutable once a session has been started on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// Unix domain socket at the given path.
    Unix(PathBuf),
    /// TCP socket.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Socket path for Unix endpoints.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp { .. } => None,
        }
    }

    /// Emulator `-chardev` value describing a client socket to this endpoint.
    ///
    /// ```text
    /// socket,id=mon,path=/tmp/x/mon.sock
    /// socket,id=mon,host=127.0.0.1,port=4444
    /// ```
    pub fn chardev_spec(&self, id: &str) -> String {
        match self {
            Endpoint::Unix(path) => format!("socket,id={},path={}", id, path.display()),
            Endpoint::Tcp { host, port } => {
                format!("socket,id={},host={},port={}", id, host, port)
            }
        }
    }

    /// Address in the `unix:PATH` / `tcp:HOST:PORT` form used by `-qmp`.
    pub fn to_uri(&self) -> String {
        match self {
            Endpoint::Unix(path) => format!("unix:{}", path.display()),
            Endpoint::Tcp { host, port } => format!("tcp:{}:{}", host, port),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chardev_spec() {
        let unix = Endpoint::unix("/tmp/vm/mon.sock");
        assert_eq!(unix.chardev_spec("mon"), "socket,id=mon,path=/tmp/vm/mon.sock");

        let tcp = Endpoint::tcp("127.0.0.1", 4444);
        assert_eq!(
            tcp.chardev_spec("mon"),
            "socket,id=mon,host=127.0.0.1,port=4444"
        );
    }

    #[test]
    fn test_uri() {
        assert_eq!(Endpoint::unix("/a/b.sock").to_uri(), "unix:/a/b.sock");
        assert_eq!(Endpoint::tcp("localhost", 5000).to_string(), "tcp:localhost:5000");
        assert!(Endpoint::tcp("localhost", 5000).path().is_none());
    }

    #[test]
    fn test_serde_roundtrip() {
        let endpoint = Endpoint::tcp("localhost", 5001);
        let json = serde_json::to_string(&endpoint).unwrap();
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, endpoint);
    }
}
