//! Scripted emulator-side peer for monitor tests.

use std::future::Future;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use vmharness_shared::Endpoint;

use super::transport::{Connection, Listener};

pub(crate) const GREETING: &[u8] = br#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 99, "major": 9}, "package": "v9.99.0"}, "capabilities": []}}"#;

/// Generous bound so a broken test fails instead of hanging.
const PEER_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct MockPeer {
    conn: Connection,
}

impl MockPeer {
    /// Dial a listening monitor.
    pub(crate) async fn connect(endpoint: &Endpoint) -> Self {
        Self {
            conn: Connection::connect(endpoint).await.unwrap(),
        }
    }

    pub(crate) async fn send_line(&mut self, line: &[u8]) {
        self.conn.write_line(line).await.unwrap();
    }

    pub(crate) async fn send(&mut self, value: Value) {
        self.send_line(value.to_string().as_bytes()).await;
    }

    /// Next JSON object from the client, `None` once it hung up.
    pub(crate) async fn recv(&mut self) -> Option<Value> {
        match self.conn.read_line(Some(PEER_TIMEOUT)).await {
            Ok(Some(line)) => Some(serde_json::from_slice(&line).unwrap()),
            Ok(None) => None,
            Err(e) if matches!(e, vmharness_shared::HarnessError::ConnectionReset(_)) => None,
            Err(e) => panic!("mock peer read failed: {}", e),
        }
    }

    pub(crate) async fn expect_command(&mut self, name: &str) -> Value {
        let command = self.recv().await.expect("client hung up");
        assert_eq!(command["execute"], name, "unexpected command {}", command);
        command
    }

    pub(crate) async fn greet(&mut self) {
        self.send_line(GREETING).await;
    }

    /// Greeting plus a successful `qmp_capabilities` exchange.
    pub(crate) async fn handshake(&mut self) {
        self.greet().await;
        self.expect_command("qmp_capabilities").await;
        self.send(json!({"return": {}})).await;
    }

    /// Block until the client closes its side.
    pub(crate) async fn wait_closed(&mut self) {
        while self.recv().await.is_some() {}
    }
}

/// Listen on `endpoint` and run `script` against the first client.
pub(crate) async fn serve<F, Fut>(endpoint: &Endpoint, script: F) -> JoinHandle<()>
where
    F: FnOnce(MockPeer) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = Listener::bind(endpoint).await.unwrap();
    tokio::spawn(async move {
        let conn = listener.accept(Some(PEER_TIMEOUT)).await.unwrap();
        script(MockPeer { conn }).await;
    })
}

pub(crate) fn event(name: &str) -> Value {
    json!({"event": name, "timestamp": {"seconds": 1700000000, "microseconds": 0}})
}

pub(crate) fn event_with(name: &str, data: Value) -> Value {
    json!({"event": name, "data": data, "timestamp": {"seconds": 1700000000, "microseconds": 0}})
}
