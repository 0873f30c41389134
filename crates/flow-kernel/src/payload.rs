//! The tagged-sum payload type carried by every [`crate::envelope::Message`].
//!
//! Modeled after the donor kernel's `AgentMessage` tagged enum: rather than
//! relying on runtime model validation of arbitrary records (as the Python
//! source does), every payload variant is named up front and opaque
//! application records live in [`Payload::User`], carrying a
//! `serde_json::Value` plus an optional `schema_id` used by
//! [`crate::graph::NodePolicy`] validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;
use crate::stream::{ArtifactChunk, StreamChunk};

/// Carries the running state of a controller loop: a node with
/// `allow_cycle = true` inspects and updates this payload each iteration
/// until a [`FinalAnswer`] is produced or a budget in
/// [`crate::budget`] is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub query: String,
    #[serde(default)]
    pub hops: u32,
    pub budget_hops: u32,
    #[serde(default)]
    pub tokens_used: u64,
    pub budget_tokens: u64,
}

impl WorkingMemory {
    pub fn new(query: impl Into<String>, budget_hops: u32, budget_tokens: u64) -> Self {
        Self {
            query: query.into(),
            hops: 0,
            budget_hops,
            tokens_used: 0,
            budget_tokens,
        }
    }
}

/// Terminates a controller cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub text: String,
}

impl FinalAnswer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A pause signal bubbled to the egress by [`crate::graph`]-declared tool
/// nodes (see `Context::pause` in `flow-runtime`). Resume is not a core
/// operation; the planner collaborator rebuilds a trajectory from the
/// `resume_token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pause {
    pub reason: String,
    pub payload: Value,
    pub resume_token: String,
}

/// The opaque application record variant. `schema_id` names a model
/// registered for validation by a node's [`crate::graph::NodePolicy`]; it is
/// `None` for nodes that don't opt into validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub value: Value,
    pub schema_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Payload {
    Chunk(StreamChunk),
    Artifact(ArtifactChunk),
    WorkingMemory(WorkingMemory),
    FinalAnswer(FinalAnswer),
    Error(FlowError),
    Pause(Pause),
    User(UserRecord),
}

impl Payload {
    pub fn user(value: impl Into<Value>) -> Self {
        Payload::User(UserRecord {
            value: value.into(),
            schema_id: None,
        })
    }

    pub fn user_with_schema(value: impl Into<Value>, schema_id: impl Into<String>) -> Self {
        Payload::User(UserRecord {
            value: value.into(),
            schema_id: Some(schema_id.into()),
        })
    }

    pub fn as_working_memory(&self) -> Option<&WorkingMemory> {
        match self {
            Payload::WorkingMemory(wm) => Some(wm),
            _ => None,
        }
    }

    pub fn as_final_answer(&self) -> Option<&FinalAnswer> {
        match self {
            Payload::FinalAnswer(fa) => Some(fa),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&FlowError> {
        match self {
            Payload::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Chunk(_) => "StreamChunk",
            Payload::Artifact(_) => "ArtifactChunk",
            Payload::WorkingMemory(_) => "WorkingMemory",
            Payload::FinalAnswer(_) => "FinalAnswer",
            Payload::Error(_) => "FlowError",
            Payload::Pause(_) => "Pause",
            Payload::User(_) => "User",
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::user(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::user(Value::String(value.to_string()))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::user(Value::String(value))
    }
}

impl From<FlowError> for Payload {
    fn from(err: FlowError) -> Self {
        Payload::Error(err)
    }
}

impl From<WorkingMemory> for Payload {
    fn from(wm: WorkingMemory) -> Self {
        Payload::WorkingMemory(wm)
    }
}

impl From<FinalAnswer> for Payload {
    fn from(answer: FinalAnswer) -> Self {
        Payload::FinalAnswer(answer)
    }
}

impl From<Pause> for Payload {
    fn from(pause: Pause) -> Self {
        Payload::Pause(pause)
    }
}

impl From<UserRecord> for Payload {
    fn from(record: UserRecord) -> Self {
        Payload::User(record)
    }
}

impl From<StreamChunk> for Payload {
    fn from(chunk: StreamChunk) -> Self {
        Payload::Chunk(chunk)
    }
}

impl From<ArtifactChunk> for Payload {
    fn from(chunk: ArtifactChunk) -> Self {
        Payload::Artifact(chunk)
    }
}

/// A registered schema descriptor used by declared-input/output validation
/// (spec §9: "Validation is a schema-interpreter pass, not reflection").
/// Kept intentionally minimal — a named set of required JSON field paths —
/// since the spec does not prescribe a schema language.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub required_fields: Vec<String>,
}

impl ModelSchema {
    pub fn new(name: impl Into<String>, required_fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            required_fields,
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let Value::Object(map) = value else {
            return Err(format!(
                "schema `{}` requires a JSON object, got {}",
                self.name,
                value_type_name(value)
            ));
        };
        for field in &self.required_fields {
            if !map.contains_key(field) {
                return Err(format!(
                    "schema `{}` requires field `{field}`",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A registry of named schemas, looked up by `schema_id`.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    schemas: HashMap<String, ModelSchema>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ModelSchema) -> &mut Self {
        self.schemas.insert(schema.name.clone(), schema);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModelSchema> {
        self.schemas.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_memory_starts_at_zero_hops() {
        let wm = WorkingMemory::new("q", 4, 1000);
        assert_eq!(wm.hops, 0);
        assert_eq!(wm.tokens_used, 0);
    }

    #[test]
    fn schema_validation_catches_missing_field() {
        let schema = ModelSchema::new("Input", vec!["text".into()]);
        let err = schema.validate(&serde_json::json!({"other": 1})).unwrap_err();
        assert!(err.contains("text"));
        assert!(schema.validate(&serde_json::json!({"text": "hi"})).is_ok());
    }

    #[test]
    fn registry_looks_up_by_name() {
        let mut registry = ModelRegistry::new();
        registry.register(ModelSchema::new("Input", vec!["text".into()]));
        assert!(registry.get("Input").is_some());
        assert!(registry.get("Missing").is_none());
    }
}
