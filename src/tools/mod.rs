//! Native tools.
//!
//! A tool is a node whose work operation is a plain async function over its
//! JSON arguments. Tools are grouped into [`ToolCollection`]s, which register
//! as capability providers: permitting a collection's name permits every tool
//! in it.

pub mod presets;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::engine::{Mesh, NodeError};
use crate::envelope::{Output, Request};
use crate::node::{CapabilityProvider, Node, NodeConfig, NodeKind, NodeRef};

/// Boxed tool body.
pub type ToolFn =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value, NodeError>> + Send + Sync>;

/// A tool backed by an async closure.
pub struct FunctionTool {
    config: NodeConfig,
    schema: Value,
    func: ToolFn,
}

impl FunctionTool {
    pub fn new<F, Fut>(config: NodeConfig, func: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        Self {
            config,
            schema: json!({"type": "object", "properties": {}}),
            func: Arc::new(move |args| Box::pin(func(args))),
        }
    }

    /// JSON schema advertised to agents.
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }
}

#[async_trait]
impl Node for FunctionTool {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, request: &Request, _mesh: &Mesh) -> Result<Output, NodeError> {
        let value = (self.func)(request.arguments.clone()).await?;
        Ok(Output::new(value))
    }
}

/// A named bundle of tools, registered as one capability provider.
pub struct ToolCollection {
    name: String,
    tools: Vec<NodeRef>,
}

impl ToolCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: NodeRef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
}

#[async_trait]
impl CapabilityProvider for ToolCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> anyhow::Result<Vec<NodeRef>> {
        tracing::debug!(collection = %self.name, tools = ?self.tool_names(), "Registering tool collection");
        Ok(self.tools.clone())
    }
}

/// Deserialize a tool's arguments into a typed struct.
pub fn parse_args<T: serde::de::DeserializeOwned>(args: Map<String, Value>) -> Result<T, NodeError> {
    serde_json::from_value(Value::Object(args))
        .map_err(|e| NodeError::transient(format!("Invalid arguments: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::envelope::{Category, NodeState};
    use crate::registry::MeshBuilder;
    use crate::testing::args;

    #[tokio::test]
    async fn test_function_tool_returns_value() {
        let echo = FunctionTool::new(NodeConfig::new("echo"), |args| async move {
            Ok(args.get("text").cloned().unwrap_or(Value::Null))
        });
        let mesh = MeshBuilder::new(Config::default())
            .register(Arc::new(echo))
            .build()
            .await
            .unwrap();
        let response = mesh
            .invoke(Request::root("echo", Category::Tool, args(json!({"text": "hi"}))))
            .await;
        assert_eq!(response.state, NodeState::Completed);
        assert_eq!(response.output, json!("hi"));
    }

    #[tokio::test]
    async fn test_collection_contributes_tools() {
        let collection = ToolCollection::new("bundle")
            .with_tool(Arc::new(FunctionTool::new(NodeConfig::new("a"), |_| async {
                Ok(Value::Null)
            })))
            .with_tool(Arc::new(FunctionTool::new(NodeConfig::new("b"), |_| async {
                Ok(Value::Null)
            })));
        assert_eq!(collection.tool_names(), vec!["a", "b"]);
        let nodes = collection.init().await.unwrap();
        assert_eq!(nodes.len(), 2);
    }
}
