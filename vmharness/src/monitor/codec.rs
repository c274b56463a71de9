//! QMP message framing: command encoding and structural decoding.
//!
//! Every message is one JSON object per line. Incoming objects are
//! classified by shape:
//!
//! ```text
//! {"QMP": {...}}                 -> Greeting
//! {"event": "...", ...}          -> Event
//! {"return": ...} | {"error": ..} -> Reply
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vmharness_shared::{HarnessError, HarnessResult};

/// Longest excerpt of offending input quoted in a malformed-data error.
const EXCERPT_LEN: usize = 120;

/// A decoded incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Greeting(Greeting),
    Reply(Reply),
    Event(Event),
}

/// Contents of the `QMP` member sent by the emulator right after connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    #[serde(default)]
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

impl Greeting {
    /// `(major, minor, micro)` from `version.qemu`, when present.
    pub fn emulator_version(&self) -> Option<(u64, u64, u64)> {
        let qemu = self.version.get("qemu")?;
        Some((
            qemu.get("major")?.as_u64()?,
            qemu.get("minor")?.as_u64()?,
            qemu.get("micro")?.as_u64()?,
        ))
    }

    /// Free-form package string, e.g. `v9.99.0`.
    pub fn package(&self) -> Option<&str> {
        self.version.get("package").and_then(Value::as_str)
    }
}

/// Answer to exactly one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `{"return": value}`
    Return(Value),
    /// `{"error": {"class": ..., "desc": ...}}`
    Error(Value),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// The reply as it appeared on the wire.
    pub fn to_value(&self) -> Value {
        match self {
            Reply::Return(value) => serde_json::json!({ "return": value }),
            Reply::Error(payload) => serde_json::json!({ "error": payload }),
        }
    }

    /// Unwrap the `return` value, converting an error reply for `command`
    /// into [`HarnessError::Command`].
    pub fn into_result(self, command: &str) -> HarnessResult<Value> {
        match self {
            Reply::Return(value) => Ok(value),
            Reply::Error(payload) => Err(HarnessError::command(command, payload)),
        }
    }
}

/// Emulator-side event timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTimestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

impl EventTimestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let nanos = u32::try_from(self.microseconds.checked_mul(1000)?).ok()?;
        DateTime::from_timestamp(self.seconds, nanos)
    }
}

/// Unsolicited asynchronous notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<EventTimestamp>,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            timestamp: None,
        }
    }

    /// Whole event as a JSON object (`event`, `data`, `timestamp`).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outgoing command frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            execute: name.into(),
            arguments: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Serialize as a single newline-terminated JSON line.
    pub fn encode(&self) -> HarnessResult<String> {
        let mut line = serde_json::to_string(self).map_err(|e| {
            HarnessError::Internal(format!("failed to encode command {}: {}", self.execute, e))
        })?;
        line.push('\n');
        Ok(line)
    }
}

/// Translate caller-side `snake_case` argument keys into the hyphenated
/// form used on the wire. Only top-level keys are rewritten.
pub fn translate_keys(arguments: Map<String, Value>) -> Map<String, Value> {
    arguments
        .into_iter()
        .map(|(key, value)| (key.replace('_', "-"), value))
        .collect()
}

/// Parse one line as JSON.
pub fn parse(line: &[u8]) -> HarnessResult<Value> {
    serde_json::from_slice(line)
        .map_err(|e| HarnessError::MalformedData(format!("{} in {:?}", e, excerpt(line))))
}

/// Classify a parsed JSON value.
pub fn classify(value: Value) -> HarnessResult<Message> {
    let Value::Object(mut object) = value else {
        return Err(HarnessError::MalformedData(format!(
            "expected a JSON object, got {}",
            value
        )));
    };

    if let Some(greeting) = object.remove("QMP") {
        return serde_json::from_value(greeting)
            .map(Message::Greeting)
            .map_err(|e| HarnessError::MalformedData(format!("invalid greeting: {}", e)));
    }

    if object.contains_key("event") {
        return serde_json::from_value(Value::Object(object))
            .map(Message::Event)
            .map_err(|e| HarnessError::MalformedData(format!("invalid event: {}", e)));
    }

    match (object.remove("return"), object.remove("error")) {
        (Some(value), None) => Ok(Message::Reply(Reply::Return(value))),
        (None, Some(payload)) => Ok(Message::Reply(Reply::Error(payload))),
        (Some(_), Some(_)) => Err(HarnessError::MalformedData(
            "reply carries both 'return' and 'error'".into(),
        )),
        (None, None) => Err(HarnessError::MalformedData(format!(
            "unrecognized message {}",
            Value::Object(object)
        ))),
    }
}

/// Parse and classify one line.
pub fn decode(line: &[u8]) -> HarnessResult<Message> {
    classify(parse(line)?)
}

fn excerpt(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    if text.chars().count() <= EXCERPT_LEN {
        text.into_owned()
    } else {
        let cut: String = text.chars().take(EXCERPT_LEN).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GREETING: &[u8] = br#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 99, "major": 9}, "package": "v9.99.0"}, "capabilities": ["oob"]}}"#;

    #[test]
    fn test_decode_greeting() {
        let Message::Greeting(greeting) = decode(GREETING).unwrap() else {
            panic!("expected greeting");
        };
        assert_eq!(greeting.emulator_version(), Some((9, 99, 0)));
        assert_eq!(greeting.package(), Some("v9.99.0"));
        assert_eq!(greeting.capabilities, vec![json!("oob")]);
    }

    #[test]
    fn test_decode_event() {
        let line = br#"{"event": "STOP", "timestamp": {"seconds": 1700000000, "microseconds": 250000}}"#;
        let Message::Event(event) = decode(line).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.name, "STOP");
        assert!(event.data.is_null());
        let ts = event.timestamp.unwrap().to_datetime().unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_micros(), 250_000);
    }

    #[test]
    fn test_decode_replies() {
        assert_eq!(
            decode(br#"{"return": {}}"#).unwrap(),
            Message::Reply(Reply::Return(json!({})))
        );

        let Message::Reply(reply) =
            decode(br#"{"error": {"class": "GenericError", "desc": "nope"}, "id": 3}"#).unwrap()
        else {
            panic!("expected reply");
        };
        assert!(reply.is_error());
        let err = reply.into_result("cont").unwrap_err();
        assert!(matches!(err, HarnessError::Command { ref desc, .. } if desc == "nope"));
    }

    #[test]
    fn test_decode_malformed() {
        for line in [
            &b"__DATA__THAT_IS_NOT_JSON__"[..],
            b"{}",
            b"[1, 2]",
            br#"{"return": 1, "error": {}}"#,
            br#"{"QMP": 5}"#,
        ] {
            let err = decode(line).unwrap_err();
            assert!(
                matches!(err, HarnessError::MalformedData(_)),
                "{:?} gave {:?}",
                String::from_utf8_lossy(line),
                err
            );
        }
    }

    #[test]
    fn test_encode_command() {
        let plain = Command::new("query-status").encode().unwrap();
        assert_eq!(plain, "{\"execute\":\"query-status\"}\n");

        let mut args = Map::new();
        args.insert("device".into(), json!("drive0"));
        let line = Command::new("eject").with_arguments(args).encode().unwrap();
        assert_eq!(line, "{\"execute\":\"eject\",\"arguments\":{\"device\":\"drive0\"}}\n");
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_translate_keys_is_deterministic() {
        let build = || {
            let mut args = Map::new();
            args.insert("command_line".into(), json!("info migrate"));
            args.insert("cpu_index".into(), json!(0));
            args.insert("nested_map".into(), json!({"keep_me": 1}));
            Command::new("human-monitor-command")
                .with_arguments(translate_keys(args))
                .encode()
                .unwrap()
        };

        let first = build();
        assert_eq!(first, build());
        assert!(first.contains("\"command-line\""));
        assert!(first.contains("\"cpu-index\""));
        assert!(first.contains("\"keep_me\""));
        assert!(!first.contains("command_line"));
    }

    #[test]
    fn test_event_to_value() {
        let event = Event::new("BLOCK_JOB_COMPLETED", json!({"device": "drive0"}));
        assert_eq!(
            event.to_value(),
            json!({"event": "BLOCK_JOB_COMPLETED", "data": {"device": "drive0"}})
        );
    }
}
