//! Tool contracts and the registry.
//!
//! A tool exposes a name, a JSON argument descriptor, and a synchronous
//! `execute` boundary (async fn, but the orchestrator awaits it to
//! completion before moving on). Tools validate their own arguments and
//! assume the policy engine already approved the call — the only
//! policy-shaped work they do are the mechanical post-checks the rules
//! assign them: file-size stat before open, address pinning on connect,
//! redirect re-evaluation, cwd containment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use capsule_policy::{PinnedHost, PolicyEngine};
use capsule_protocol::{Policy, RunId, ToolOutcome};
use serde_json::{Value, json};
use thiserror::Error;

pub mod fs;
pub mod http;
pub mod shell;

pub use fs::{FsReadTool, FsWriteTool};
pub use http::HttpGetTool;
pub use shell::ShellRunTool;

/// Unexpected tool failures. Expected failures (bad arguments, refused
/// post-checks) are reported as [`ToolOutcome::Failure`] instead; both end
/// up as `error` results in the audit log.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    BadArgs(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("timeout")]
    Timeout,
}

impl ToolError {
    /// Stable numeric error code (2xxx range).
    pub fn code(&self) -> u16 {
        match self {
            Self::BadArgs(_) => 2001,
            Self::Io(_) => 2002,
            Self::Http(_) => 2003,
            Self::Timeout => 2004,
        }
    }
}

/// Everything a tool may consult during one call. Timestamps and ids are
/// deliberately absent — those belong to the store.
#[derive(Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub working_dir: PathBuf,
    pub policy: Arc<Policy>,
    pub engine: Arc<PolicyEngine>,
    /// Resolved addresses for `http.get`, set by the orchestrator from the
    /// policy verdict. The tool connects to these, never re-resolving.
    pub pinned: Option<PinnedHost>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON argument descriptor, consumed by planners and documentation.
    fn schema(&self) -> Value;
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError>;
}

/// Name-keyed tool lookup. Read-only at run time.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptor map handed to planners: tool name to description+schema.
    pub fn schemas(&self) -> Value {
        let mut map = serde_json::Map::new();
        for name in self.names() {
            if let Some(tool) = self.tools.get(&name) {
                map.insert(
                    name.clone(),
                    json!({
                        "description": tool.description(),
                        "schema": tool.schema(),
                    }),
                );
            }
        }
        Value::Object(map)
    }

    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(FsReadTool));
        registry.register(Arc::new(FsWriteTool));
        registry.register(Arc::new(HttpGetTool));
        registry.register(Arc::new(ShellRunTool));
        registry
    }
}
