//! QMP monitor client.
//!
//! ## Session state machine
//!
//! ```text
//! Unconnected ──connect/accept──▶ Connected ──greeting──▶ Greeted ──close──▶ Closed
//!                                     │                      │
//!                                     └──protocol failure────┴──────────────▶ Closed
//! ```
//!
//! Commands and events share one line-oriented channel. Every line read
//! while waiting for a reply is classified; events that show up in between
//! are queued in arrival order instead of being dropped or mistaken for the
//! reply.

pub mod codec;
pub mod events;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use vmharness_shared::{Endpoint, HarnessError, HarnessResult};

pub use codec::{Command, Event, EventTimestamp, Greeting, Message, Reply, translate_keys};
pub use events::{EventQueue, Wait, event_match};
pub use transport::{Connection, Listener};

/// Upper bound for the greeting to arrive after the socket connects.
const GREETING_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound for the emulator to connect to a listening monitor.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Command that leaves capabilities negotiation mode.
const CAPABILITIES_COMMAND: &str = "qmp_capabilities";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connected,
    Greeted,
    Closed,
}

/// One monitor session with one emulator.
///
/// Not shareable: every operation takes `&mut self`, which also guarantees
/// that at most one command is in flight.
pub struct MonitorClient {
    endpoint: Endpoint,
    listener: Option<Listener>,
    conn: Option<Connection>,
    state: SessionState,
    greeting: Option<Greeting>,
    events: EventQueue,
    command_timeout: Option<Duration>,
}

impl std::fmt::Debug for MonitorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("queued_events", &self.events.len())
            .finish()
    }
}

impl MonitorClient {
    /// Client-role monitor that will dial `endpoint` on [`connect`](Self::connect).
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            listener: None,
            conn: None,
            state: SessionState::Unconnected,
            greeting: None,
            events: EventQueue::new(),
            command_timeout: None,
        }
    }

    /// Server-role monitor bound to `endpoint` right away, so the socket
    /// exists before the emulator is started. Complete the session with
    /// [`accept`](Self::accept).
    pub async fn listen(endpoint: Endpoint) -> HarnessResult<Self> {
        let listener = Listener::bind(&endpoint).await?;
        let endpoint = listener.local_endpoint()?;
        tracing::debug!(endpoint = %endpoint, "Monitor listening");

        let mut client = Self::new(endpoint);
        client.listener = Some(listener);
        Ok(client)
    }

    /// Address of the session (for TCP port 0 listeners, the assigned port).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_greeted(&self) -> bool {
        self.state == SessionState::Greeted
    }

    /// Greeting received during the handshake.
    pub fn greeting(&self) -> Option<&Greeting> {
        self.greeting.as_ref()
    }

    /// Bound how long [`cmd`](Self::cmd) waits for a reply. A command that
    /// times out closes the session, since its late reply could otherwise be
    /// attributed to the next command.
    pub fn set_command_timeout(&mut self, timeout: Option<Duration>) {
        self.command_timeout = timeout;
    }

    /// Dial the emulator and complete the handshake.
    ///
    /// With `negotiate`, also leaves capabilities negotiation mode.
    ///
    /// # Errors
    ///
    /// - `Connect` if the first message is not a greeting
    /// - `MalformedData` if the first line is not JSON
    /// - `Capabilities` if negotiation is rejected
    pub async fn connect(&mut self, negotiate: bool) -> HarnessResult<Greeting> {
        self.ensure_unconnected()?;
        if self.listener.is_some() {
            return Err(HarnessError::InvalidState(
                "listening monitor must accept, not connect".into(),
            ));
        }

        let connected = Connection::connect(&self.endpoint).await;
        let conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        self.conn = Some(conn);
        self.handshake(negotiate).await
    }

    /// Accept the emulator's connection on a listening monitor, then
    /// complete the handshake including capabilities negotiation.
    pub async fn accept(&mut self, timeout: Option<Duration>) -> HarnessResult<Greeting> {
        self.ensure_unconnected()?;
        let listener = self.listener.as_ref().ok_or_else(|| {
            HarnessError::InvalidState("monitor is not listening, use connect".into())
        })?;

        let accepted = listener.accept(timeout).await;
        let conn = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        tracing::debug!(peer = conn.peer(), "Monitor accepted connection");
        self.conn = Some(conn);
        self.listener = None;
        self.handshake(true).await
    }

    async fn handshake(&mut self, negotiate: bool) -> HarnessResult<Greeting> {
        self.state = SessionState::Connected;

        let line = match self.read_raw(Some(GREETING_TIMEOUT)).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(self.fail(HarnessError::Connect(
                    "connection closed before greeting".into(),
                )));
            }
            Err(e) => return Err(self.fail(e)),
        };

        let value = match codec::parse(&line) {
            Ok(value) => value,
            Err(e) => return Err(self.fail(e)),
        };
        let greeting = match codec::classify(value) {
            Ok(Message::Greeting(greeting)) => greeting,
            _ => {
                return Err(self.fail(HarnessError::Connect(format!(
                    "expected greeting, got {}",
                    String::from_utf8_lossy(&line)
                ))));
            }
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            version = ?greeting.emulator_version(),
            capabilities = greeting.capabilities.len(),
            "Monitor greeting received"
        );
        self.greeting = Some(greeting.clone());
        self.state = SessionState::Greeted;

        if negotiate {
            self.negotiate_capabilities().await?;
        }
        Ok(greeting)
    }

    async fn negotiate_capabilities(&mut self) -> HarnessResult<()> {
        let reason = match self
            .exchange(&Command::new(CAPABILITIES_COMMAND), Some(GREETING_TIMEOUT))
            .await
        {
            Ok(Reply::Return(_)) => return Ok(()),
            Ok(Reply::Error(payload)) => HarnessError::command(CAPABILITIES_COMMAND, payload).to_string(),
            Err(e) => e.to_string(),
        };
        Err(self.fail(HarnessError::Capabilities(reason)))
    }

    /// Send one command and wait for its reply.
    ///
    /// Events arriving before the reply are queued. Error replies are
    /// returned as [`Reply::Error`], not as `Err`.
    pub async fn cmd(&mut self, name: &str, arguments: Option<Map<String, Value>>) -> HarnessResult<Reply> {
        let mut command = Command::new(name);
        command.arguments = arguments;
        self.cmd_obj(&command).await
    }

    /// Send a prebuilt command frame and wait for its reply.
    pub async fn cmd_obj(&mut self, command: &Command) -> HarnessResult<Reply> {
        self.ensure_greeted()?;
        self.exchange(command, self.command_timeout).await
    }

    /// Like [`cmd`](Self::cmd), but error replies become
    /// [`HarnessError::Command`] and success yields the `return` value.
    pub async fn command(&mut self, name: &str, arguments: Option<Map<String, Value>>) -> HarnessResult<Value> {
        self.cmd(name, arguments).await?.into_result(name)
    }

    async fn exchange(&mut self, command: &Command, timeout: Option<Duration>) -> HarnessResult<Reply> {
        let line = command.encode()?;
        tracing::trace!(command = %command.execute, ">>> {}", line.trim_end());

        let written = match self.conn.as_mut() {
            Some(conn) => conn.write_line(line.as_bytes()).await,
            None => return Err(HarnessError::MonitorClosed),
        };
        if let Err(e) = written {
            return Err(self.fail(e));
        }

        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let message = match self.read_message(remaining).await {
                Ok(message) => message,
                Err(e) if e.is_timeout() => {
                    return Err(self.fail(HarnessError::Timeout(format!(
                        "no reply to '{}' within {:?}",
                        command.execute,
                        timeout.unwrap_or_default()
                    ))));
                }
                Err(e) => return Err(e),
            };

            match message {
                Message::Reply(reply) => {
                    tracing::trace!(command = %command.execute, error = reply.is_error(), "<<< reply");
                    return Ok(reply);
                }
                Message::Event(event) => {
                    tracing::trace!(event = %event.name, "Queueing event received before reply");
                    self.events.push(event);
                }
                Message::Greeting(_) => {
                    return Err(self.fail(HarnessError::Protocol(format!(
                        "unexpected greeting while waiting for reply to '{}'",
                        command.execute
                    ))));
                }
            }
        }
    }

    /// Next event, oldest first.
    ///
    /// Queued events are returned without touching the socket. Otherwise:
    /// `NoWait` returns `None` if nothing is immediately available,
    /// `Forever` blocks, `Timeout` fails with [`HarnessError::Timeout`].
    pub async fn pull_event(&mut self, wait: Wait) -> HarnessResult<Option<Event>> {
        if let Some(event) = self.events.pop() {
            return Ok(Some(event));
        }
        self.ensure_greeted()?;

        let timeout = match wait {
            Wait::NoWait => Some(Duration::ZERO),
            Wait::Forever => None,
            Wait::Timeout(limit) => Some(limit),
        };
        match self.read_message(timeout).await {
            Ok(Message::Event(event)) => Ok(Some(event)),
            Ok(other) => Err(self.fail(HarnessError::Protocol(format!(
                "expected an event, got {:?}",
                other
            )))),
            Err(e) if e.is_timeout() && wait == Wait::NoWait => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All available events in arrival order, emptying the queue.
    ///
    /// With a blocking `wait` and nothing queued, first waits for one event;
    /// then drains whatever else is immediately available.
    pub async fn get_events(&mut self, wait: Wait) -> HarnessResult<Vec<Event>> {
        let mut events = self.events.drain();
        if self.state != SessionState::Greeted && !events.is_empty() {
            return Ok(events);
        }

        if events.is_empty() && wait.is_blocking() {
            events.extend(self.pull_event(wait).await?);
        }
        while let Some(event) = self.pull_event(Wait::NoWait).await? {
            events.push(event);
        }
        Ok(events)
    }

    /// Wait for an event called `name` that matches `pattern`.
    ///
    /// Queued events are searched first. Live events that don't match are
    /// queued behind the existing ones. `timeout` bounds the whole wait.
    pub async fn event_wait(
        &mut self,
        name: &str,
        timeout: Duration,
        pattern: Option<&Value>,
    ) -> HarnessResult<Event> {
        let wanted =
            |event: &Event| event.name == name && pattern.is_none_or(|p| event_match(&event.to_value(), p));

        if let Some(event) = self.events.take_first(&wanted) {
            return Ok(event);
        }
        self.ensure_greeted()?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timed_out =
                || HarnessError::Timeout(format!("event {} not received within {:?}", name, timeout));
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let event = match self.read_message(Some(remaining)).await {
                Ok(Message::Event(event)) => event,
                Ok(other) => {
                    return Err(self.fail(HarnessError::Protocol(format!(
                        "expected an event, got {:?}",
                        other
                    ))));
                }
                Err(e) if e.is_timeout() => return Err(timed_out()),
                Err(e) => return Err(e),
            };

            if wanted(&event) {
                return Ok(event);
            }
            self.events.push(event);
        }
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn queued_events(&self) -> usize {
        self.events.len()
    }

    /// Release the socket. Idempotent; the session cannot be reused.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.listener = None;
        if self.state != SessionState::Closed {
            tracing::debug!(endpoint = %self.endpoint, "Monitor closed");
        }
        self.state = SessionState::Closed;
    }

    fn ensure_unconnected(&self) -> HarnessResult<()> {
        match self.state {
            SessionState::Unconnected => Ok(()),
            SessionState::Closed => Err(HarnessError::MonitorClosed),
            _ => Err(HarnessError::InvalidState("monitor already connected".into())),
        }
    }

    fn ensure_greeted(&self) -> HarnessResult<()> {
        match self.state {
            SessionState::Greeted => Ok(()),
            SessionState::Closed => Err(HarnessError::MonitorClosed),
            SessionState::Unconnected | SessionState::Connected => Err(HarnessError::InvalidState(
                "monitor greeting not received yet".into(),
            )),
        }
    }

    /// Drop the session after a fatal error and hand the error back.
    fn fail(&mut self, err: HarnessError) -> HarnessError {
        tracing::debug!(endpoint = %self.endpoint, error = %err, "Closing monitor session");
        self.abort();
        err
    }

    fn abort(&mut self) {
        self.conn = None;
        self.listener = None;
        self.state = SessionState::Closed;
    }

    async fn read_raw(&mut self, timeout: Option<Duration>) -> HarnessResult<Option<Vec<u8>>> {
        let conn = self.conn.as_mut().ok_or(HarnessError::MonitorClosed)?;
        conn.read_line(timeout).await
    }

    /// Read and decode the next non-blank line.
    ///
    /// EOF and malformed data close the session; timeouts leave it open.
    async fn read_message(&mut self, timeout: Option<Duration>) -> HarnessResult<Message> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let line = match self.read_raw(remaining).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(self.fail(HarnessError::ConnectionReset(format!(
                        "monitor {} closed by peer",
                        self.endpoint
                    ))));
                }
                Err(e) if e.is_timeout() => return Err(e),
                Err(e) => return Err(self.fail(e)),
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return codec::decode(&line).map_err(|e| self.fail(e));
        }
    }
}
