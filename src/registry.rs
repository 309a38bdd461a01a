//! Node registry and permission resolution.
//!
//! # Structure
//! - Nodes indexed by their globally unique name
//! - Capability providers map to the names of the nodes they contributed
//! - Each entry owns the node's concurrency semaphore and its resolved
//!   permitted-callee set
//!
//! # Invariants
//! - Node and provider names are unique across the registry
//! - At most one master node
//! - The registry is read-only once `MeshBuilder::build` returns

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::engine::Mesh;
use crate::events::MessageSink;
use crate::memory::HistoryStore;
use crate::node::{NodeKind, NodeRef, ProviderRef};

/// Errors raised while assembling a mesh.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Node or provider name registered twice: {0}")]
    DuplicateNode(String),

    #[error("{node} permits unknown callee {callee}")]
    UnknownCallee { node: String, callee: String },

    #[error("More than one master node: {0} and {1}")]
    MultipleMasters(String, String),

    #[error("Provider {provider} failed to initialize: {message}")]
    ProviderInit { provider: String, message: String },
}

/// A registered node with its execution resources.
pub struct NodeEntry {
    pub node: NodeRef,
    /// Execution slots; `concurrency_limit` permits
    pub(crate) slots: Arc<Semaphore>,
    permitted: HashSet<String>,
    /// Provider that contributed this node, if any
    provider: Option<String>,
}

impl NodeEntry {
    /// Resolved set of names this node may call.
    pub fn permitted(&self) -> &HashSet<String> {
        &self.permitted
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }
}

/// Summary of a node for listings.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub kind: NodeKind,
    pub description: String,
    pub is_master: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub permitted_callees: Vec<String>,
    pub parameters: serde_json::Value,
}

/// Immutable name → node table.
pub struct NodeRegistry {
    entries: HashMap<String, NodeEntry>,
    providers: HashMap<String, Vec<String>>,
    master: Option<String>,
}

impl NodeRegistry {
    /// Build the table and resolve every node's permitted set once.
    ///
    /// `permitted = explicit names ∪ provider sub-nodes − excluded`
    ///
    /// # Errors
    /// Returns error on duplicate names, unknown callees, or several masters.
    pub fn resolve(
        nodes: Vec<(NodeRef, Option<String>)>,
        providers: HashMap<String, Vec<String>>,
    ) -> Result<Self, RegistryError> {
        let mut by_name: HashMap<String, (NodeRef, Option<String>)> = HashMap::new();
        let mut master: Option<String> = None;

        for (node, provider) in nodes {
            let name = node.name().to_string();
            if by_name.contains_key(&name) || providers.contains_key(&name) {
                return Err(RegistryError::DuplicateNode(name));
            }
            if node.config().is_master {
                if let Some(existing) = &master {
                    return Err(RegistryError::MultipleMasters(existing.clone(), name));
                }
                master = Some(name.clone());
            }
            by_name.insert(name, (node, provider));
        }

        let mut entries = HashMap::with_capacity(by_name.len());
        for (name, (node, provider)) in &by_name {
            let config = node.config();
            let mut permitted = HashSet::new();
            for callee in &config.permitted_callees {
                if by_name.contains_key(callee) {
                    permitted.insert(callee.clone());
                } else if let Some(sub_nodes) = providers.get(callee) {
                    permitted.extend(sub_nodes.iter().cloned());
                } else {
                    return Err(RegistryError::UnknownCallee {
                        node: name.clone(),
                        callee: callee.clone(),
                    });
                }
            }
            permitted.retain(|callee| !config.excluded_callees.contains(callee));

            tracing::debug!(
                node = %name,
                permitted = permitted.len(),
                limit = config.concurrency_limit,
                "Resolved node permissions"
            );

            entries.insert(
                name.clone(),
                NodeEntry {
                    node: Arc::clone(node),
                    slots: Arc::new(Semaphore::new(config.concurrency_limit.max(1))),
                    permitted,
                    provider: provider.clone(),
                },
            );
        }

        Ok(Self {
            entries,
            providers,
            master,
        })
    }

    pub fn get(&self, name: &str) -> Option<&NodeEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Default entry point for top-level chats.
    pub fn master(&self) -> Option<&str> {
        self.master.as_deref()
    }

    /// Whether `caller` may invoke `callee` according to the resolved sets.
    pub fn is_permitted(&self, caller: &str, callee: &str) -> bool {
        self.entries
            .get(caller)
            .map(|entry| entry.permitted.contains(callee))
            .unwrap_or(false)
    }

    /// Names of the nodes a provider contributed.
    pub fn provider_nodes(&self, provider: &str) -> &[String] {
        self.providers
            .get(provider)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All node names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Node summaries, sorted by name.
    pub fn describe(&self) -> Vec<NodeInfo> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                let entry = self.entries.get(&name)?;
                let mut permitted: Vec<String> = entry.permitted.iter().cloned().collect();
                permitted.sort();
                Some(NodeInfo {
                    kind: entry.node.kind(),
                    description: entry.node.description().to_string(),
                    is_master: entry.node.config().is_master,
                    provider: entry.provider.clone(),
                    permitted_callees: permitted,
                    parameters: entry.node.parameters_schema(),
                    name,
                })
            })
            .collect()
    }
}

/// Collects nodes, providers and collaborators, then builds a [`Mesh`].
pub struct MeshBuilder {
    config: Config,
    nodes: Vec<NodeRef>,
    providers: Vec<ProviderRef>,
    history: Option<Arc<dyn HistoryStore>>,
    sink: Option<Arc<dyn MessageSink>>,
}

impl MeshBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            providers: Vec::new(),
            history: None,
            sink: None,
        }
    }

    pub fn register(mut self, node: NodeRef) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn provider(mut self, provider: ProviderRef) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Initialize providers, resolve permissions and freeze the registry.
    ///
    /// # Errors
    /// Returns error if a provider fails to initialize or resolution fails.
    /// Providers initialized before the failure are cleaned up.
    pub async fn build(self) -> Result<Mesh, RegistryError> {
        let mut nodes: Vec<(NodeRef, Option<String>)> =
            self.nodes.into_iter().map(|n| (n, None)).collect();
        let mut provider_nodes: HashMap<String, Vec<String>> = HashMap::new();

        for (index, provider) in self.providers.iter().enumerate() {
            let name = provider.name().to_string();
            if provider_nodes.contains_key(&name) {
                cleanup_all(&self.providers[..index]).await;
                return Err(RegistryError::DuplicateNode(name));
            }
            match provider.init().await {
                Ok(contributed) => {
                    tracing::info!(
                        provider = %name,
                        nodes = contributed.len(),
                        "Capability provider initialized"
                    );
                    let names = contributed.iter().map(|n| n.name().to_string()).collect();
                    provider_nodes.insert(name.clone(), names);
                    nodes.extend(contributed.into_iter().map(|n| (n, Some(name.clone()))));
                }
                Err(e) => {
                    tracing::error!(provider = %name, "Capability provider init failed: {:#}", e);
                    cleanup_all(&self.providers[..index]).await;
                    return Err(RegistryError::ProviderInit {
                        provider: name,
                        message: format!("{:#}", e),
                    });
                }
            }
        }

        let registry = match NodeRegistry::resolve(nodes, provider_nodes) {
            Ok(registry) => registry,
            Err(e) => {
                cleanup_all(&self.providers).await;
                return Err(e);
            }
        };

        tracing::info!(
            nodes = registry.len(),
            master = registry.master().unwrap_or("-"),
            "Mesh registry built"
        );

        Ok(Mesh::new(
            self.config,
            registry,
            self.providers,
            self.history,
            self.sink,
        ))
    }
}

async fn cleanup_all(providers: &[ProviderRef]) {
    for provider in providers {
        provider.cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FunctionTool, ToolCollection};
    use crate::node::NodeConfig;
    use serde_json::json;

    fn tool(config: NodeConfig) -> NodeRef {
        Arc::new(FunctionTool::new(config, |_args| async move { Ok(json!("ok")) }))
    }

    #[tokio::test]
    async fn test_permission_union_of_explicit_and_provider_minus_excluded() {
        let collection = ToolCollection::new("math")
            .with_tool(tool(NodeConfig::new("add")))
            .with_tool(tool(NodeConfig::new("mul")));
        let mesh = MeshBuilder::new(Config::default())
            .register(tool(NodeConfig::new("search")))
            .register(tool(
                NodeConfig::new("agent")
                    .permit(["search", "math"])
                    .exclude(["mul"]),
            ))
            .provider(Arc::new(collection))
            .build()
            .await
            .unwrap();

        let registry = mesh.registry();
        let permitted = registry.get("agent").unwrap().permitted();
        assert!(permitted.contains("search"));
        assert!(permitted.contains("add"));
        assert!(!permitted.contains("mul"));
        assert_eq!(registry.provider_nodes("math").len(), 2);
        assert_eq!(registry.get("add").unwrap().provider(), Some("math"));
    }

    #[tokio::test]
    async fn test_unknown_callee_is_rejected_at_build() {
        let result = MeshBuilder::new(Config::default())
            .register(tool(NodeConfig::new("agent").permit(["ghost"])))
            .build()
            .await;
        assert!(matches!(
            result,
            Err(RegistryError::UnknownCallee { callee, .. }) if callee == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_multiple_masters() {
        let dup = MeshBuilder::new(Config::default())
            .register(tool(NodeConfig::new("a")))
            .register(tool(NodeConfig::new("a")))
            .build()
            .await;
        assert!(matches!(dup, Err(RegistryError::DuplicateNode(n)) if n == "a"));

        let masters = MeshBuilder::new(Config::default())
            .register(tool(NodeConfig::new("a").master()))
            .register(tool(NodeConfig::new("b").master()))
            .build()
            .await;
        assert!(matches!(masters, Err(RegistryError::MultipleMasters(..))));
    }

    #[tokio::test]
    async fn test_describe_is_sorted() {
        let mesh = MeshBuilder::new(Config::default())
            .register(tool(NodeConfig::new("zeta")))
            .register(tool(NodeConfig::new("alpha").master()))
            .build()
            .await
            .unwrap();
        let infos = mesh.registry().describe();
        assert_eq!(infos[0].name, "alpha");
        assert!(infos[0].is_master);
        assert_eq!(mesh.registry().master(), Some("alpha"));
    }
}
