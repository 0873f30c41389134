//! The message envelope that flows between nodes.
//!
//! An envelope carries a `trace_id`, a `payload`, `headers`, an optional
//! `deadline_s`, and a `meta` propagation bag. Every field except `payload`
//! (and, at the node author's discretion, `meta`) is copied unchanged when a
//! node derives a new message from one it received — "copy envelope, replace
//! payload".

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::payload::Payload;

/// Opaque key/value propagation bag. Carried by reference between envelopes
/// that share ancestry, since headers and `meta` are logically immutable
/// once a trace starts.
pub type HeaderMap = HashMap<String, String>;
pub type MetaMap = HashMap<String, Value>;

/// The unit that flows between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub trace_id: String,
    pub payload: Payload,
    pub headers: HeaderMap,
    /// Absolute wall-clock deadline, expressed as seconds since the Unix
    /// epoch. `None` means no deadline.
    pub deadline_s: Option<f64>,
    pub meta: MetaMap,
}

impl Message {
    pub fn new(trace_id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            trace_id: trace_id.into(),
            payload: payload.into(),
            headers: HeaderMap::new(),
            deadline_s: None,
            meta: MetaMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_deadline_s(mut self, deadline_s: f64) -> Self {
        self.deadline_s = Some(deadline_s);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn tenant(&self) -> Option<&str> {
        self.headers.get("tenant").map(String::as_str)
    }

    /// Derive a new message carrying `payload`, preserving every other
    /// field. This is the *only* sanctioned way to produce a derived
    /// message — nodes that build a `Message` from scratch instead of
    /// calling `with_payload` break the envelope-preservation invariant
    /// checked by the testkit.
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            payload: payload.into(),
            headers: self.headers.clone(),
            deadline_s: self.deadline_s,
            meta: self.meta.clone(),
        }
    }

    /// True once `deadline_s` has passed relative to `now` (seconds since
    /// the Unix epoch).
    pub fn deadline_passed(&self, now: f64) -> bool {
        matches!(self.deadline_s, Some(d) if now >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_payload_preserves_non_payload_fields() {
        let m = Message::new("t-1", Payload::user(serde_json::json!("ping")))
            .with_header("tenant", "bench")
            .with_deadline_s(100.0)
            .with_meta("k", "v");

        let derived = m.with_payload(Payload::user(serde_json::json!("pong")));

        assert_eq!(derived.trace_id, m.trace_id);
        assert_eq!(derived.headers, m.headers);
        assert_eq!(derived.deadline_s, m.deadline_s);
        assert_eq!(derived.meta, m.meta);
        assert_ne!(derived.payload, m.payload);
    }

    #[test]
    fn deadline_passed_is_inclusive() {
        let m = Message::new("t-1", Payload::user(serde_json::json!(null))).with_deadline_s(10.0);
        assert!(m.deadline_passed(10.0));
        assert!(m.deadline_passed(11.0));
        assert!(!m.deadline_passed(9.9));
    }

    #[test]
    fn no_deadline_never_passes() {
        let m = Message::new("t-1", Payload::user(serde_json::json!(null)));
        assert!(!m.deadline_passed(f64::MAX));
    }
}
