//! Error taxonomy.
//!
//! Two distinct error layers, matching the donor kernel's split between a
//! `thiserror`-derived enum and an `error_stack::Report`-wrapped result
//! alias:
//!
//! - [`FlowError`] is *data*: a structured failure value that the worker
//!   lifecycle constructs and routes like any other payload (§7: "FlowError
//!   is data, not an exception"). It is plain, `Clone`, and serializable —
//!   never wrapped in an `error_stack::Report`.
//! - [`RuntimeError`] covers failures in constructing or operating the
//!   runtime itself (topology validation, closed queues, config errors) —
//!   genuine `?`-propagated failures, composed into
//!   [`RuntimeResult`] via `error_stack::Report` so that callers can attach
//!   human-readable context as the error travels up the call stack.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error taxonomy codes (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowErrorCode {
    Validation,
    Timeout,
    NodeException,
    DeadlineExceeded,
    Cycle,
    Cancelled,
    /// Specialized codes for the RemoteNode collaborator; not interpreted
    /// by the core, only threaded through.
    Remote(RemoteErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    CallStart,
    CallSuccess,
    CallError,
    CallCancelled,
    StreamEvent,
}

impl fmt::Display for FlowErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowErrorCode::Validation => write!(f, "VALIDATION"),
            FlowErrorCode::Timeout => write!(f, "TIMEOUT"),
            FlowErrorCode::NodeException => write!(f, "NODE_EXCEPTION"),
            FlowErrorCode::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
            FlowErrorCode::Cycle => write!(f, "CYCLE"),
            FlowErrorCode::Cancelled => write!(f, "CANCELLED"),
            FlowErrorCode::Remote(kind) => write!(f, "REMOTE_{kind:?}"),
        }
    }
}

/// A structured failure value carried as a [`crate::payload::Payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowError {
    pub code: FlowErrorCode,
    pub message: String,
    pub trace_id: String,
    pub node_name: String,
    pub original_exception_type: Option<String>,
    pub original_traceback: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl FlowError {
    pub fn new(
        code: FlowErrorCode,
        message: impl Into<String>,
        trace_id: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            trace_id: trace_id.into(),
            node_name: node_name.into(),
            original_exception_type: None,
            original_traceback: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_original(
        mut self,
        exception_type: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        self.original_exception_type = Some(exception_type.into());
        self.original_traceback = Some(traceback.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] node={} trace={}: {}",
            self.code, self.node_name, self.trace_id, self.message
        )
    }
}

impl std::error::Error for FlowError {}

/// Crate-level error type covering runtime construction and operation
/// failures — distinct from [`FlowError`], which is flow *data*.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("graph topology rejected: cycle through {nodes:?} without allow_cycle")]
    Cycle { nodes: Vec<String> },

    #[error("node `{0}` referenced in an adjacency but never declared")]
    UnknownNode(String),

    #[error("node `{0}` declared more than once")]
    DuplicateNode(String),

    #[error("edge is closed")]
    EdgeClosed,

    #[error("trace cancelled")]
    Cancelled,

    #[error("unknown routing target `{0}`")]
    UnknownTarget(String),

    #[error("ambiguous emit: node `{0}` has multiple successors and no target or broadcast policy")]
    AmbiguousEmit(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

/// Convenience alias using [`error_stack::Report`], matching the donor
/// kernel's `KernelResult` pattern.
pub type RuntimeResult<T> = Result<T, error_stack::Report<RuntimeError>>;
