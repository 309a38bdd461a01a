//! Nodes - the executable units (agents, tools, model endpoints) of a mesh.
//!
//! # Node Kinds
//! - **Agent**: reasons and calls other nodes (ReAct, parallel, chat, workflow)
//! - **Tool**: native function exposed to agents
//! - **Llm**: model endpoint called with a message list
//! - **Remote**: tool backed by an external protocol client
//!
//! Every kind goes through the same lifecycle (`Mesh::invoke`); the kind only
//! decides the category reported in requests and events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::NodeDefaults;
use crate::engine::{Mesh, NodeError};
use crate::envelope::{Category, Output, Request, Response};

/// Reference to a registered node.
pub type NodeRef = Arc<dyn Node>;

/// Diagnostic tag for a node implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    Tool,
    Llm,
    Remote,
}

impl NodeKind {
    /// Category reported for this kind in requests and events.
    pub fn category(&self) -> Category {
        match self {
            NodeKind::Agent => Category::Agent,
            NodeKind::Tool | NodeKind::Remote => Category::Tool,
            NodeKind::Llm => Category::Llm,
        }
    }
}

/// Static per-node configuration. Immutable after registration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Globally unique name
    pub name: String,

    pub description: String,

    /// Names this node may call, in declaration order. May include capability
    /// providers, which expand to all of their sub-nodes.
    pub permitted_callees: Vec<String>,

    /// Names removed from the resolved permitted set
    pub excluded_callees: HashSet<String>,

    /// Whether callers need this node in their permitted set
    pub is_permission_required: bool,

    /// Maximum simultaneous work operations
    pub concurrency_limit: usize,

    /// Per-attempt timeout
    pub timeout: Duration,

    /// Extra attempts after the first
    pub retries: u32,

    pub retry_delay: Duration,

    /// Default entry point for top-level chats
    pub is_master: bool,

    /// Report requests/responses to the history collaborator
    pub persist: bool,

    /// Notify the sink when another node calls this one
    pub send_tool_call: bool,

    /// Notify the sink with this node's output when called by another node
    pub send_observation: bool,
}

impl NodeConfig {
    /// Create a configuration with built-in defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_defaults(name, &NodeDefaults::default())
    }

    /// Create a configuration from configured defaults.
    pub fn with_defaults(name: impl Into<String>, defaults: &NodeDefaults) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            permitted_callees: Vec::new(),
            excluded_callees: HashSet::new(),
            is_permission_required: true,
            concurrency_limit: defaults.concurrency_limit.max(1),
            timeout: defaults.timeout,
            retries: defaults.retries,
            retry_delay: defaults.retry_delay,
            is_master: false,
            persist: false,
            send_tool_call: true,
            send_observation: true,
        }
    }

    /// Replace the lifecycle settings with configured defaults.
    pub fn defaults(self, defaults: &NodeDefaults) -> Self {
        self.timeout(defaults.timeout)
            .retries(defaults.retries)
            .retry_delay(defaults.retry_delay)
            .concurrency_limit(defaults.concurrency_limit)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Allow calling the given nodes or providers.
    pub fn permit<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.permitted_callees.contains(&name) {
                self.permitted_callees.push(name);
            }
        }
        self
    }

    /// Remove the given names from the resolved permitted set.
    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_callees
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn permission_required(mut self, required: bool) -> Self {
        self.is_permission_required = required;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn master(mut self) -> Self {
        self.is_master = true;
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn send_tool_call(mut self, send: bool) -> Self {
        self.send_tool_call = send;
        self
    }

    pub fn send_observation(mut self, send: bool) -> Self {
        self.send_observation = send;
        self
    }

    /// Total attempts allowed per invocation.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Base trait for everything that can be invoked in a mesh.
///
/// # Invariants
/// - `execute()` is only ever called by `Mesh::invoke`, which applies hooks,
///   permission checks, the concurrency limit and the retry policy
/// - `execute()` reports failures as `Err`; it never needs to build a
///   `Response` itself
#[async_trait]
pub trait Node: Send + Sync {
    fn config(&self) -> &NodeConfig;

    fn kind(&self) -> NodeKind;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn description(&self) -> &str {
        &self.config().description
    }

    /// JSON schema of the arguments this node accepts.
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Question or instruction for this node"
                }
            },
            "required": ["query"]
        })
    }

    /// Callee-specific request enrichment, run before permission checks.
    async fn pre_process(&self, request: Request, _mesh: &Mesh) -> Result<Request, NodeError> {
        Ok(request)
    }

    /// The work operation.
    async fn execute(&self, request: &Request, mesh: &Mesh) -> Result<Output, NodeError>;

    /// Callee-specific response shaping, run after the retry loop.
    async fn post_process(&self, response: Response, _request: &Request, _mesh: &Mesh) -> Response {
        response
    }
}

/// A bundle that contributes several nodes under one name (e.g. a tool
/// collection or a remote tool server).
///
/// Listing a provider's name in `permitted_callees` permits all of its nodes.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Connect/prepare and return the nodes this provider contributes.
    async fn init(&self) -> anyhow::Result<Vec<NodeRef>>;

    /// Release resources on mesh shutdown.
    async fn cleanup(&self) {}
}

/// Reference to a registered capability provider.
pub type ProviderRef = Arc<dyn CapabilityProvider>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permit_deduplicates_and_keeps_order() {
        let cfg = NodeConfig::new("a").permit(["x", "y"]).permit(["x", "z"]);
        assert_eq!(cfg.permitted_callees, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(NodeConfig::new("a").retries(2).max_attempts(), 3);
        assert_eq!(NodeConfig::new("a").retries(0).max_attempts(), 1);
    }

    #[test]
    fn test_concurrency_limit_at_least_one() {
        assert_eq!(NodeConfig::new("a").concurrency_limit(0).concurrency_limit, 1);
    }

    #[test]
    fn test_kind_category() {
        assert_eq!(NodeKind::Remote.category(), Category::Tool);
        assert_eq!(NodeKind::Llm.category(), Category::Llm);
    }
}
