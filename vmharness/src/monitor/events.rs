//! Event buffering and matching.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;

use super::codec::Event;

/// How long an event read may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Return immediately when nothing is available.
    #[default]
    NoWait,
    /// Block until the next event arrives.
    Forever,
    /// Block for at most the given duration.
    Timeout(Duration),
}

impl Wait {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Wait::NoWait)
    }
}

impl From<bool> for Wait {
    fn from(wait: bool) -> Self {
        if wait { Wait::Forever } else { Wait::NoWait }
    }
}

impl From<Duration> for Wait {
    fn from(timeout: Duration) -> Self {
        Wait::Timeout(timeout)
    }
}

/// FIFO of events that were received but not yet consumed.
///
/// Events land here when they arrive while a command is waiting for its
/// reply, or while [`event_wait`](super::MonitorClient::event_wait) skips
/// events that don't match. Order is always arrival order.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Oldest queued event.
    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Remove and return the oldest event satisfying `pred`, leaving the
    /// rest in place.
    pub fn take_first<F>(&mut self, mut pred: F) -> Option<Event>
    where
        F: FnMut(&Event) -> bool,
    {
        let index = self.events.iter().position(|event| pred(event))?;
        self.events.remove(index)
    }

    pub fn drain(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Recursive subset match of `pattern` against `event`.
///
/// - `null` pattern matches anything
/// - object pattern: every key must exist in `event`; object values recurse,
///   everything else compares by equality
/// - any other pattern compares by equality
///
/// ```text
/// {"data": {"device": "d0"}} matches  {"event": "X", "data": {"device": "d0", "len": 5}}
/// {"data": null}             matches  any event carrying "data"
/// {"data": {"other": null}}  no match {"event": "X", "data": {"device": "d0"}}
/// ```
pub fn event_match(event: &Value, pattern: &Value) -> bool {
    match pattern {
        Value::Null => true,
        Value::Object(expected) => {
            let Value::Object(actual) = event else {
                return false;
            };
            expected.iter().all(|(key, want)| match actual.get(key) {
                Some(have @ Value::Object(_)) => event_match(have, want),
                Some(have) => have == want,
                None => false,
            })
        }
        other => event == other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(name: &str) -> Event {
        Event::new(name, Value::Null)
    }

    #[test]
    fn test_queue_fifo() {
        let mut queue = EventQueue::new();
        queue.push(ev("A"));
        queue.push(ev("B"));
        queue.push(ev("C"));

        assert_eq!(queue.pop().unwrap().name, "A");
        let names: Vec<_> = queue.drain().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["B", "C"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_first_keeps_order() {
        let mut queue = EventQueue::new();
        for name in ["A", "B", "A", "C"] {
            queue.push(ev(name));
        }
        let found = queue.take_first(|e| e.name == "A").unwrap();
        assert_eq!(found.name, "A");
        assert!(queue.take_first(|e| e.name == "Z").is_none());

        let names: Vec<_> = queue.drain().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["B", "A", "C"]);
    }

    #[test]
    fn test_event_match() {
        let event = json!({"event": "BLOCK_JOB_COMPLETED", "data": {"device": "d0", "len": 5}});

        assert!(event_match(&event, &Value::Null));
        assert!(event_match(&event, &json!({"data": {"device": "d0"}})));
        assert!(event_match(&event, &json!({"data": null})));
        assert!(event_match(&event, &json!({"event": "BLOCK_JOB_COMPLETED"})));

        assert!(!event_match(&event, &json!({"data": {"device": "d1"}})));
        assert!(!event_match(&event, &json!({"data": {"other": null}})));
        assert!(!event_match(&event, &json!({"missing": 1})));
        assert!(!event_match(&json!({"data": 3}), &json!({"data": {"x": 1}})));
    }

    #[test]
    fn test_wait_conversions() {
        assert_eq!(Wait::from(false), Wait::NoWait);
        assert_eq!(Wait::from(true), Wait::Forever);
        assert!(Wait::from(Duration::from_secs(1)).is_blocking());
        assert!(!Wait::default().is_blocking());
    }
}
