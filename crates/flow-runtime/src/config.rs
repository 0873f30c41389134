//! Layered runtime defaults (queue capacity, default timeouts, the
//! FlowError routing mode) — grounded in the donor kernel's
//! `config` crate layering (`mofa-kernel/src/config/mod.rs`: defaults <
//! file < environment), trimmed to the handful of knobs the core actually
//! exposes at `create()` time (spec §4.1, §7, §9).

use config::{Config as Layered, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use flow_kernel::error::RuntimeError;

/// How a `FlowError` produced after retry/validation exhaustion is
/// delivered to the caller (spec §4.4, §7, §9). The spec's own "Open
/// Question" recommends `Rookery` as the default — see `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorRoutingMode {
    /// Route the error like any other payload through the node's normal
    /// successors (falling back to the rookery if the node is egress).
    Payload,
    /// Always route directly to the rookery, bypassing normal successors.
    Rookery,
    /// Route to the rookery, but `Runtime::fetch()` converts a `FlowError`
    /// payload into an `Err` instead of returning it as data.
    RaiseAtFetch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity applied to every edge unless the graph overrides it at
    /// `create()` time (spec §4.1: "default 64").
    pub queue_maxsize: usize,
    pub error_routing: ErrorRoutingMode,
    /// Capacity of the anonymous ingress ("open-sea") and egress
    /// ("rookery") queues.
    pub boundary_queue_maxsize: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_maxsize: 64,
            // Spec §9's own recommendation for the unresolved "Open
            // Question"; see DESIGN.md.
            error_routing: ErrorRoutingMode::Rookery,
            boundary_queue_maxsize: 64,
        }
    }
}

impl RuntimeConfig {
    /// Layer defaults, then an optional config file, then `FLOW_*`
    /// environment variables (`FLOW_QUEUE_MAXSIZE`, `FLOW_ERROR_ROUTING`,
    /// ...), matching the donor's defaults-then-file-then-env order.
    pub fn load(path: Option<&str>) -> Result<Self, RuntimeError> {
        let mut builder = Layered::builder().add_source(
            Layered::try_from(&Self::default())
                .map_err(|e| RuntimeError::Config(e.to_string()))?,
        );

        if let Some(path) = path {
            let format = detect_format(path)?;
            builder = builder.add_source(File::new(path, format));
        }

        builder = builder.add_source(Environment::with_prefix("FLOW").separator("__"));

        let layered = builder
            .build()
            .map_err(|e| RuntimeError::Config(e.to_string()))?;
        layered
            .try_deserialize()
            .map_err(|e| RuntimeError::Config(e.to_string()))
    }
}

fn detect_format(path: &str) -> Result<FileFormat, RuntimeError> {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| RuntimeError::Config(format!("no extension on config path `{path}`")))?;
    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        other => Err(RuntimeError::Config(format!(
            "unsupported config format `{other}`"
        ))),
    }
}
