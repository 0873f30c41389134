//! Core data model for the dataflow runtime: the message envelope, the
//! tagged-sum payload, streaming chunk types, the error taxonomy, graph
//! topology, the trace registry, and controller budget accounting.
//!
//! `flow-runtime` builds the execution engine (queues, worker lifecycle,
//! scheduler, patterns) on top of the types defined here.

pub mod budget;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod payload;
pub mod stream;
pub mod telemetry;
pub mod trace;

pub use envelope::Message;
pub use error::{FlowError, FlowErrorCode, RuntimeError, RuntimeResult};
pub use graph::{Graph, GraphBuilder, NodePolicy, NodeSpec};
pub use payload::{FinalAnswer, Payload, WorkingMemory};
pub use stream::{ArtifactChunk, StreamChunk};
pub use trace::TraceRegistry;
