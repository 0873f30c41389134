//! `StreamChunk` and `ArtifactChunk` — ordered partial outputs identified by
//! `stream_id`. Grounded in the donor kernel's
//! `AgentMessage::StreamMessage { stream_id, message, sequence }` vocabulary,
//! split into two concrete shapes (text vs. opaque artifact bytes) per spec
//! §3/§4.8.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ChunkMeta = HashMap<String, Value>;

/// A single partial text output for `stream_id`. The ordering contract
/// (strictly increasing `seq`, exactly one `done=true` record carrying the
/// maximum `seq`) is a contract for node authors, not enforced by the
/// runtime itself — see `flow_runtime::testkit` for the checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: String,
    pub seq: u64,
    pub text: String,
    pub done: bool,
    #[serde(default)]
    pub meta: ChunkMeta,
}

impl StreamChunk {
    pub fn new(stream_id: impl Into<String>, seq: u64, text: impl Into<String>, done: bool) -> Self {
        Self {
            stream_id: stream_id.into(),
            seq,
            text: text.into(),
            done,
            meta: ChunkMeta::new(),
        }
    }
}

/// Same shape as [`StreamChunk`] but carries opaque artifact bytes and an
/// `artifact_type` tag instead of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactChunk {
    pub stream_id: String,
    pub seq: u64,
    #[serde(with = "artifact_bytes")]
    pub chunk: Vec<u8>,
    pub artifact_type: String,
    pub done: bool,
    #[serde(default)]
    pub meta: ChunkMeta,
}

impl ArtifactChunk {
    pub fn new(
        stream_id: impl Into<String>,
        seq: u64,
        chunk: Vec<u8>,
        artifact_type: impl Into<String>,
        done: bool,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            seq,
            chunk,
            artifact_type: artifact_type.into(),
            done,
            meta: ChunkMeta::new(),
        }
    }
}

/// `base64`-encodes `ArtifactChunk::chunk` for its serde form, matching the
/// donor's own `STANDARD_NO_PAD` data-URL encoding
/// (`mofa-foundation/src/llm/vision.rs`).
mod artifact_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD_NO_PAD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A per-`stream_id` sequence tracker, used by `Context::emit_chunk` /
/// `emit_artifact` to assign monotonic `seq` values when the caller does not
/// supply one explicitly.
#[derive(Debug, Default)]
pub struct SeqAllocator {
    next: HashMap<String, u64>,
}

impl SeqAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number for `stream_id` and advances the
    /// counter.
    pub fn next_seq(&mut self, stream_id: &str) -> u64 {
        let entry = self.next.entry(stream_id.to_string()).or_insert(0);
        let seq = *entry;
        *entry += 1;
        seq
    }
}
