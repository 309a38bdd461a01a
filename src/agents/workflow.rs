//! Workflow agent: a user-supplied async function that orchestrates calls.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::engine::{Mesh, NodeError};
use crate::envelope::{Output, Request};
use crate::node::{Node, NodeConfig, NodeKind};

/// Boxed workflow body. Receives its own request and the mesh, so it can
/// reach permitted nodes through `Mesh::call`.
pub type WorkflowFn =
    Arc<dyn Fn(Request, Mesh) -> BoxFuture<'static, Result<Output, NodeError>> + Send + Sync>;

pub struct WorkflowAgent {
    config: NodeConfig,
    func: WorkflowFn,
}

impl WorkflowAgent {
    pub fn new<F, Fut>(config: NodeConfig, func: F) -> Self
    where
        F: Fn(Request, Mesh) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output, NodeError>> + Send + 'static,
    {
        Self {
            config,
            func: Arc::new(move |request, mesh| Box::pin(func(request, mesh))),
        }
    }
}

#[async_trait]
impl Node for WorkflowAgent {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Agent
    }

    async fn execute(&self, request: &Request, mesh: &Mesh) -> Result<Output, NodeError> {
        (self.func)(request.clone(), mesh.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::ChatPayload;
    use crate::envelope::NodeState;
    use crate::registry::MeshBuilder;
    use crate::testing::args;
    use crate::tools::presets::math_tools;
    use serde_json::json;

    #[tokio::test]
    async fn test_workflow_chains_tools() {
        // (3 + 4) * 5
        let workflow = WorkflowAgent::new(
            NodeConfig::new("pipeline").permit(["math_tools"]).master(),
            |request, mesh| async move {
                let sum = mesh
                    .call(&request, "add", args(json!({"a": 3, "b": 4})))
                    .await;
                if !sum.is_completed() {
                    return Err(NodeError::transient(sum.text()));
                }
                let product = mesh
                    .call(&request, "multiply", args(json!({"a": sum.output, "b": 5})))
                    .await;
                Ok(Output::new(product.output))
            },
        );
        let mesh = MeshBuilder::new(Config::default())
            .provider(Arc::new(math_tools()))
            .register(Arc::new(workflow))
            .build()
            .await
            .unwrap();

        let response = mesh.chat(ChatPayload::new("compute")).await;
        assert_eq!(response.state, NodeState::Completed);
        assert_eq!(response.output, json!(35));
    }

    #[tokio::test]
    async fn test_workflow_respects_permissions() {
        let workflow = WorkflowAgent::new(
            NodeConfig::new("pipeline").master().retries(0),
            |request, mesh| async move {
                let response = mesh.call(&request, "add", args(json!({"a": 1, "b": 1}))).await;
                Ok(Output::new(json!({"state": response.state})))
            },
        );
        let mesh = MeshBuilder::new(Config::default())
            .provider(Arc::new(math_tools()))
            .register(Arc::new(workflow))
            .build()
            .await
            .unwrap();

        let response = mesh.chat(ChatPayload::new("compute")).await;
        assert_eq!(response.output["state"], json!("REJECTED"));
    }
}
