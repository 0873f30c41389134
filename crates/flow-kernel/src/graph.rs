//! Graph & topology (spec §4.1): node/edge model, cycle detection,
//! validation, adjacency closure.
//!
//! Generalizes the donor's `MessageGraph` (`mofa-kernel/src/message_graph/
//! mod.rs`), which only checks *reachability* from declared entry points,
//! into true cycle detection with an `allow_cycle` opt-in per spec — a graph
//! may contain a cycle only if every node on it sets `allow_cycle = true`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::payload::ModelSchema;

/// `validate ∈ {"none", "in", "out", "both"}` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidateMode {
    #[default]
    None,
    In,
    Out,
    Both,
}

impl ValidateMode {
    pub fn validates_input(&self) -> bool {
        matches!(self, ValidateMode::In | ValidateMode::Both)
    }

    pub fn validates_output(&self) -> bool {
        matches!(self, ValidateMode::Out | ValidateMode::Both)
    }
}

/// How a node with multiple successors routes an implicit (non-targeted)
/// `emit`. Spec §4.3: "unless the node's policy says broadcast (the default
/// for fan-out patterns)".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    #[default]
    RequireTarget,
    Broadcast,
}

/// Per-node execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePolicy {
    pub validate: ValidateMode,
    pub timeout_s: Option<f64>,
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_mult: f64,
    pub backoff_max: f64,
    pub fan_out: FanOutMode,
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            validate: ValidateMode::None,
            timeout_s: None,
            max_retries: 0,
            backoff_base: 0.1,
            backoff_mult: 2.0,
            backoff_max: 30.0,
            fan_out: FanOutMode::default(),
        }
    }
}

impl NodePolicy {
    pub fn builder() -> NodePolicyBuilder {
        NodePolicyBuilder::default()
    }

    /// `min(backoff_base * backoff_mult^attempt, backoff_max)` (spec §4.4).
    pub fn backoff_delay(&self, attempt: u32) -> f64 {
        let raw = self.backoff_base * self.backoff_mult.powi(attempt as i32);
        raw.min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodePolicyBuilder {
    inner: NodePolicy,
}

impl NodePolicyBuilder {
    pub fn validate(mut self, mode: ValidateMode) -> Self {
        self.inner.validate = mode;
        self
    }

    pub fn timeout_s(mut self, secs: f64) -> Self {
        self.inner.timeout_s = Some(secs);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.inner.max_retries = n;
        self
    }

    pub fn backoff(mut self, base: f64, mult: f64, max: f64) -> Self {
        self.inner.backoff_base = base;
        self.inner.backoff_mult = mult;
        self.inner.backoff_max = max;
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.inner.fan_out = FanOutMode::Broadcast;
        self
    }

    pub fn build(self) -> NodePolicy {
        self.inner
    }
}

/// A node declaration. `func` itself is not stored here — `flow-runtime`
/// pairs a `NodeSpec` with a boxed async handler when building workers — this
/// keeps `flow-kernel` free of an async-trait dependency on node bodies.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub policy: NodePolicy,
    pub allow_cycle: bool,
    pub input_schema: Option<ModelSchema>,
    pub output_schema: Option<ModelSchema>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: NodePolicy::default(),
            allow_cycle: false,
            input_schema: None,
            output_schema: None,
        }
    }

    pub fn with_policy(mut self, policy: NodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn allow_cycle(mut self) -> Self {
        self.allow_cycle = true;
        self
    }

    pub fn with_input_schema(mut self, schema: ModelSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: ModelSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// Special names for the anonymous ingress ("open-sea") and egress
/// ("rookery") queues.
pub const OPEN_SEA: &str = "__open_sea__";
pub const ROOKERY: &str = "__rookery__";

/// An adjacency: `(producer, successors)`. An empty successor list marks the
/// producer as an egress node; a node that never appears as a successor is
/// an ingress node.
#[derive(Debug, Clone)]
pub struct Adjacency {
    pub producer: String,
    pub successors: Vec<String>,
}

impl Adjacency {
    pub fn new(producer: impl Into<String>, successors: Vec<impl Into<String>>) -> Self {
        Self {
            producer: producer.into(),
            successors: successors.into_iter().map(Into::into).collect(),
        }
    }
}

/// A validated, static topology. Nodes and edges are fixed for the runtime's
/// lifetime (spec §3 Lifecycle summary: "no dynamic topology").
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: HashMap<String, NodeSpec>,
    pub successors: HashMap<String, Vec<String>>,
    pub predecessors: HashMap<String, Vec<String>>,
    pub ingress: Vec<String>,
    pub egress: Vec<String>,
    pub queue_maxsize: usize,
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: HashMap<String, NodeSpec>,
    adjacencies: Vec<Adjacency>,
    queue_maxsize: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            adjacencies: Vec::new(),
            queue_maxsize: 64,
        }
    }

    pub fn queue_maxsize(mut self, size: usize) -> Self {
        self.queue_maxsize = size;
        self
    }

    pub fn node(mut self, spec: NodeSpec) -> RuntimeResultSelf {
        if self.nodes.insert(spec.name.clone(), spec.clone()).is_some() {
            return Err(RuntimeError::DuplicateNode(spec.name));
        }
        Ok(self)
    }

    pub fn adjacency(mut self, adjacency: Adjacency) -> Self {
        self.adjacencies.push(adjacency);
        self
    }

    /// Validate the topology (§4.1): all referenced nodes present; DFS to
    /// detect cycles, rejecting any cycle unless every node on it allows
    /// it.
    pub fn build(self) -> Result<Graph, RuntimeError> {
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for name in self.nodes.keys() {
            successors.entry(name.clone()).or_default();
            predecessors.entry(name.clone()).or_default();
        }

        for adj in &self.adjacencies {
            if !self.nodes.contains_key(&adj.producer) {
                return Err(RuntimeError::UnknownNode(adj.producer.clone()));
            }
            for succ in &adj.successors {
                if !self.nodes.contains_key(succ) {
                    return Err(RuntimeError::UnknownNode(succ.clone()));
                }
                successors.entry(adj.producer.clone()).or_default().push(succ.clone());
                predecessors.entry(succ.clone()).or_default().push(adj.producer.clone());
            }
        }

        detect_disallowed_cycle(&self.nodes, &successors)?;

        let ingress: Vec<String> = self
            .nodes
            .keys()
            .filter(|name| predecessors.get(*name).map(|p| p.is_empty()).unwrap_or(true))
            .cloned()
            .collect();
        let egress: Vec<String> = self
            .nodes
            .keys()
            .filter(|name| successors.get(*name).map(|s| s.is_empty()).unwrap_or(true))
            .cloned()
            .collect();

        Ok(Graph {
            nodes: self.nodes,
            successors,
            predecessors,
            ingress,
            egress,
            queue_maxsize: self.queue_maxsize,
        })
    }
}

type RuntimeResultSelf = Result<GraphBuilder, RuntimeError>;

/// DFS-based cycle detection using the classic white/gray/black
/// recursion-stack coloring. Any back-edge found closes a cycle; the cycle
/// is permitted only if every node along it has `allow_cycle = true`.
fn detect_disallowed_cycle(
    nodes: &HashMap<String, NodeSpec>,
    successors: &HashMap<String, Vec<String>>,
) -> Result<(), RuntimeError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<&str, Color> = nodes.keys().map(|n| (n.as_str(), Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        successors: &'a HashMap<String, Vec<String>>,
        nodes: &HashMap<String, NodeSpec>,
        color: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), RuntimeError> {
        color.insert(node, Color::Gray);
        stack.push(node);

        if let Some(succs) = successors.get(node) {
            for succ in succs {
                match color.get(succ.as_str()).copied().unwrap_or(Color::White) {
                    Color::White => visit(succ.as_str(), successors, nodes, color, stack)?,
                    Color::Gray => {
                        let cycle_start = stack.iter().position(|n| *n == succ.as_str()).unwrap_or(0);
                        let cycle: Vec<String> = stack[cycle_start..].iter().map(|s| s.to_string()).collect();
                        let all_allow = cycle.iter().all(|n| {
                            nodes.get(n).map(|spec| spec.allow_cycle).unwrap_or(false)
                        });
                        if !all_allow {
                            return Err(RuntimeError::Cycle { nodes: cycle });
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        color.insert(node, Color::Black);
        Ok(())
    }

    let mut names: Vec<&str> = nodes.keys().map(String::as_str).collect();
    names.sort_unstable();
    for name in names {
        if color.get(name).copied().unwrap_or(Color::White) == Color::White {
            visit(name, successors, nodes, &mut color, &mut stack)?;
        }
    }
    Ok(())
}

impl Graph {
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    pub fn successors_of(&self, name: &str) -> &[String] {
        self.successors.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors_of(&self, name: &str) -> &[String] {
        self.predecessors.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_egress(&self, name: &str) -> bool {
        self.egress.iter().any(|n| n == name)
    }

    pub fn is_ingress(&self, name: &str) -> bool {
        self.ingress.iter().any(|n| n == name)
    }
}
