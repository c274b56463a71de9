//! Line-framed duplex transport over Unix domain or TCP sockets.
//!
//! Supports both roles the monitor needs:
//! - **listen/accept**: the harness owns the socket and the emulator connects
//! - **connect**: the harness dials an already listening emulator

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use vmharness_shared::{Endpoint, HarnessError, HarnessResult};

trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// Bound server socket waiting for the emulator to connect.
///
/// A Unix listener removes its socket file when dropped.
pub enum Listener {
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
    Tcp(TcpListener),
}

impl Listener {
    /// Bind to `endpoint`.
    ///
    /// A stale Unix socket file at the same path is removed first; TCP
    /// listeners set `SO_REUSEADDR`.
    pub async fn bind(endpoint: &Endpoint) -> HarnessResult<Self> {
        match endpoint {
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| HarnessError::from_io(format!("bind {}", endpoint), e))?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| HarnessError::from_io(format!("resolve {}", endpoint), e))?
                    .next()
                    .ok_or_else(|| {
                        HarnessError::InvalidArgument(format!("{} resolves to no address", endpoint))
                    })?;
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket
                    .bind(addr)
                    .map_err(|e| HarnessError::from_io(format!("bind {}", endpoint), e))?;
                Ok(Listener::Tcp(socket.listen(1)?))
            }
        }
    }

    /// The address peers should connect to.
    ///
    /// For TCP listeners bound to port 0 this reports the assigned port.
    pub fn local_endpoint(&self) -> HarnessResult<Endpoint> {
        match self {
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::tcp(addr.ip().to_string(), addr.port()))
            }
        }
    }

    /// Accept one connection, optionally bounded by `timeout`.
    pub async fn accept(&self, timeout: Option<Duration>) -> HarnessResult<Connection> {
        let accept = async {
            match self {
                Listener::Unix { listener, path } => {
                    let (stream, _) = listener.accept().await.map_err(|e| {
                        HarnessError::from_io(format!("accept on {}", path.display()), e)
                    })?;
                    Ok::<_, HarnessError>(Connection::new(
                        Box::new(stream),
                        format!("unix:{}", path.display()),
                    ))
                }
                Listener::Tcp(listener) => {
                    let (stream, peer) = listener
                        .accept()
                        .await
                        .map_err(|e| HarnessError::from_io("accept on tcp listener", e))?;
                    stream.set_nodelay(true)?;
                    Ok(Connection::new(Box::new(stream), format!("tcp:{}", peer)))
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, accept).await.map_err(|_| {
                HarnessError::Timeout(format!("no connection accepted within {:?}", limit))
            })?,
            None => accept.await,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// One established, line-framed socket connection.
///
/// Reads keep any partially received line across calls, so a read that
/// times out never loses bytes.
pub struct Connection {
    stream: BufReader<Box<dyn Duplex>>,
    pending: Vec<u8>,
    peer: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Connection {
    fn new(stream: Box<dyn Duplex>, peer: String) -> Self {
        Self {
            stream: BufReader::new(stream),
            pending: Vec::new(),
            peer,
        }
    }

    /// Dial `endpoint` as a client.
    pub async fn connect(endpoint: &Endpoint) -> HarnessResult<Self> {
        let context = || format!("connect {}", endpoint);
        let stream: Box<dyn Duplex> = match endpoint {
            Endpoint::Unix(path) => Box::new(
                UnixStream::connect(path)
                    .await
                    .map_err(|e| HarnessError::from_io(context(), e))?,
            ),
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| HarnessError::from_io(context(), e))?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
        };
        Ok(Self::new(stream, endpoint.to_string()))
    }

    /// Human readable peer address, for diagnostics.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read one line without its terminator.
    ///
    /// Returns `Ok(None)` on EOF. Bytes received before EOF without a
    /// trailing newline are returned as a final line.
    pub async fn read_line(&mut self, timeout: Option<Duration>) -> HarnessResult<Option<Vec<u8>>> {
        match timeout {
            Some(limit) => {
                let peer = self.peer.clone();
                tokio::time::timeout(limit, self.fill_line())
                    .await
                    .map_err(|_| {
                        HarnessError::Timeout(format!("no data from {} within {:?}", peer, limit))
                    })?
            }
            None => self.fill_line().await,
        }
    }

    async fn fill_line(&mut self) -> HarnessResult<Option<Vec<u8>>> {
        // `read_until` appends to `pending` and is cancellation safe.
        let read = self
            .stream
            .read_until(b'\n', &mut self.pending)
            .await
            .map_err(|e| HarnessError::from_io(format!("read from {}", self.peer), e))?;

        if self.pending.last() == Some(&b'\n') {
            let mut line = std::mem::take(&mut self.pending);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(line));
        }

        if read == 0 && self.pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.pending)))
    }

    /// Write `data` followed by a newline (unless it already ends with one).
    pub async fn write_line(&mut self, data: &[u8]) -> HarnessResult<()> {
        let peer = self.peer.clone();
        let io_err = |e| HarnessError::from_io(format!("write to {}", peer), e);

        let stream = self.stream.get_mut();
        stream.write_all(data).await.map_err(io_err)?;
        if data.last() != Some(&b'\n') {
            stream.write_all(b"\n").await.map_err(io_err)?;
        }
        stream.flush().await.map_err(io_err)
    }

    /// Shut down the write side. The socket itself is released on drop.
    pub async fn close(&mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}
