//! Remote tools over the Model Context Protocol (JSON-RPC over HTTP).
//!
//! [`McpHttpClient`] is a capability provider: `init` runs the `initialize`
//! handshake and `tools/list`, and every advertised tool becomes an
//! [`McpTool`] node. Permitting the client's name permits all of its tools.

pub mod types;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::{Mesh, NodeError};
use crate::envelope::{Output, Request};
use crate::node::{CapabilityProvider, Node, NodeConfig, NodeKind, NodeRef};
use types::*;

/// One JSON-RPC connection to a tool server.
struct Session {
    endpoint: String,
    client: reqwest::Client,
    /// Request ID counter for JSON-RPC
    request_id: AtomicU64,
}

impl Session {
    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_jsonrpc(&self, method: &str, params: Option<Value>) -> anyhow::Result<Value> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }

        let json_response: JsonRpcResponse = response.json().await?;
        if let Some(error) = json_response.error {
            anyhow::bail!("JSON-RPC error {}: {}", error.code, error.message);
        }
        json_response
            .result
            .ok_or_else(|| anyhow::anyhow!("No result in {} response", method))
    }

    async fn initialize(&self) -> anyhow::Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .send_jsonrpc("initialize", Some(serde_json::to_value(params)?))
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        // Notification: no response expected, but some servers require it.
        let notified = self
            .client
            .post(&self.endpoint)
            .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .send()
            .await;
        if let Err(e) = notified {
            tracing::debug!(endpoint = %self.endpoint, "initialized notification failed: {}", e);
        }

        Ok(init)
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        let result = self.send_jsonrpc("tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<CallToolResult> {
        let params = json!({"name": name, "arguments": arguments});
        let result = self.send_jsonrpc("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Capability provider backed by an HTTP tool server.
pub struct McpHttpClient {
    name: String,
    session: Arc<Session>,
    tool_config: Box<dyn Fn(NodeConfig) -> NodeConfig + Send + Sync>,
}

impl McpHttpClient {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            session: Arc::new(Session {
                endpoint: endpoint.into().trim_end_matches('/').to_string(),
                client,
                request_id: AtomicU64::new(1),
            }),
            tool_config: Box::new(|config| config),
        }
    }

    /// Adjust the configuration of every tool node this client creates.
    pub fn tool_config(
        mut self,
        f: impl Fn(NodeConfig) -> NodeConfig + Send + Sync + 'static,
    ) -> Self {
        self.tool_config = Box::new(f);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.session.endpoint
    }
}

#[async_trait]
impl CapabilityProvider for McpHttpClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> anyhow::Result<Vec<NodeRef>> {
        let init = self.session.initialize().await?;
        let tools = self.session.list_tools().await?;

        tracing::info!(
            provider = %self.name,
            endpoint = %self.session.endpoint,
            protocol = %init.protocol_version,
            server = init.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            tools = tools.len(),
            "Connected to tool server"
        );

        Ok(tools
            .into_iter()
            .map(|descriptor| {
                let config = (self.tool_config)(
                    NodeConfig::new(descriptor.name.clone()).description(descriptor.description.clone()),
                );
                Arc::new(McpTool {
                    config,
                    schema: descriptor.input_schema,
                    session: Arc::clone(&self.session),
                }) as NodeRef
            })
            .collect())
    }

    async fn cleanup(&self) {
        tracing::debug!(provider = %self.name, "Closing tool server session");
    }
}

/// A tool served by a remote tool server.
pub struct McpTool {
    config: NodeConfig,
    schema: Value,
    session: Arc<Session>,
}

#[async_trait]
impl Node for McpTool {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Remote
    }

    fn parameters_schema(&self) -> Value {
        if self.schema.is_null() {
            json!({"type": "object", "properties": {}})
        } else {
            self.schema.clone()
        }
    }

    async fn execute(&self, request: &Request, _mesh: &Mesh) -> Result<Output, NodeError> {
        let result = self
            .session
            .call_tool(self.name(), Value::Object(request.arguments.clone()))
            .await
            .map_err(|e| NodeError::transient(format!("Tool call failed: {:#}", e)))?;

        if result.is_error {
            return Err(NodeError::transient(format!("Tool error: {}", result.text())));
        }
        Ok(Output::new(result.text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::envelope::{Category, NodeState};
    use crate::registry::MeshBuilder;
    use crate::testing::args;
    use axum::{routing::post, Json, Router};

    async fn handle(Json(body): Json<Value>) -> Json<Value> {
        let id = body.get("id").cloned().unwrap_or(Value::Null);
        let result = match body["method"].as_str().unwrap_or_default() {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": "test-server"}
            }),
            "tools/list" => json!({"tools": [
                {"name": "echo", "description": "Echo text", "inputSchema": {"type": "object"}},
                {"name": "explode", "description": "Always fails"}
            ]}),
            "tools/call" => match body["params"]["name"].as_str() {
                Some("echo") => json!({"content": [
                    {"type": "text", "text": body["params"]["arguments"]["text"]}
                ]}),
                _ => json!({"content": [{"type": "text", "text": "boom"}], "isError": true}),
            },
            _ => return Json(json!({})),
        };
        Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    async fn spawn_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/mcp", post(handle));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/mcp", addr)
    }

    #[tokio::test]
    async fn test_tools_register_and_call() {
        let endpoint = spawn_server().await;
        let mesh = MeshBuilder::new(Config::default())
            .provider(Arc::new(
                McpHttpClient::new("remote", endpoint).tool_config(|c| c.retries(0)),
            ))
            .build()
            .await
            .unwrap();

        assert_eq!(mesh.registry().provider_nodes("remote").len(), 2);
        assert_eq!(mesh.node("echo").unwrap().kind(), NodeKind::Remote);

        let response = mesh
            .invoke(Request::root("echo", Category::Tool, args(json!({"text": "hi"}))))
            .await;
        assert_eq!(response.state, NodeState::Completed);
        assert_eq!(response.text(), "hi");

        let response = mesh
            .invoke(Request::root("explode", Category::Tool, args(json!({}))))
            .await;
        assert_eq!(response.state, NodeState::Failed);
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_build() {
        // Port 9 (discard) is closed on loopback
        let result = MeshBuilder::new(Config::default())
            .provider(Arc::new(McpHttpClient::new("remote", "http://127.0.0.1:9/mcp")))
            .build()
            .await;
        assert!(result.is_err());
    }
}
