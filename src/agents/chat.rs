//! Conversational agent: one model call per invocation, with history.

use async_trait::async_trait;
use serde_json::Value;

use super::{attach_history, attached_history, completed_text, llm_arguments};
use crate::engine::{Mesh, NodeError};
use crate::envelope::{Output, Request};
use crate::memory::Memory;
use crate::node::{Node, NodeConfig, NodeKind};

pub struct ChatAgent {
    config: NodeConfig,
    llm_name: String,
    system_prompt: String,
    short_memory_size: Option<usize>,
    llm_params: Option<Value>,
}

impl ChatAgent {
    pub fn new(name: impl Into<String>, llm_name: impl Into<String>) -> Self {
        let llm_name = llm_name.into();
        Self {
            config: NodeConfig::new(name)
                .description("Chats with the user")
                .permit([llm_name.clone()]),
            llm_name,
            system_prompt: "You are a helpful assistant.".to_string(),
            short_memory_size: None,
            llm_params: None,
        }
    }

    pub fn with_config(mut self, f: impl FnOnce(NodeConfig) -> NodeConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn short_memory_size(mut self, turns: usize) -> Self {
        self.short_memory_size = Some(turns);
        self
    }

    pub fn llm_params(mut self, params: Value) -> Self {
        self.llm_params = Some(params);
        self
    }
}

#[async_trait]
impl Node for ChatAgent {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Agent
    }

    async fn pre_process(&self, request: Request, mesh: &Mesh) -> Result<Request, NodeError> {
        let limit = self
            .short_memory_size
            .unwrap_or(mesh.config().short_memory_size);
        Ok(attach_history(request, mesh, limit).await)
    }

    async fn execute(&self, request: &Request, mesh: &Mesh) -> Result<Output, NodeError> {
        let mut memory = Memory::with_system(self.system_prompt.clone());
        memory.extend_turns(&attached_history(request));
        memory.push_user(request.query());

        let response = mesh
            .call(
                request,
                &self.llm_name,
                llm_arguments(memory.messages(), self.llm_params.as_ref()),
            )
            .await;

        match completed_text(&response)? {
            Some(answer) => {
                let mut output = Output::new(answer);
                for key in ["reasoning", "usage"] {
                    if let Some(value) = response.extra.get(key) {
                        output = output.with_extra(key, value.clone());
                    }
                }
                Ok(output)
            }
            None => Err(NodeError::transient(response.text())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::ChatPayload;
    use crate::envelope::NodeState;
    use crate::llm::Role;
    use crate::memory::InMemoryHistory;
    use crate::registry::MeshBuilder;
    use crate::testing::ScriptedLlm;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chat_threads_history() {
        let llm = ScriptedLlm::new(["Hello Ada", "Your name is Ada"]);
        let mesh = MeshBuilder::new(Config::default())
            .register(llm.node("llm"))
            .register(Arc::new(
                ChatAgent::new("chat", "llm").with_config(|c| c.master().persist(true)),
            ))
            .history(Arc::new(InMemoryHistory::new()))
            .build()
            .await
            .unwrap();

        let first = mesh.chat(ChatPayload::new("I am Ada")).await;
        assert_eq!(first.text(), "Hello Ada");
        let second = mesh
            .chat(ChatPayload::new("What is my name?").continuing(first.trace_id))
            .await;
        assert_eq!(second.text(), "Your name is Ada");

        let context = &llm.seen()[1];
        let roles: Vec<Role> = context.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(context[1].content, "I am Ada");
    }

    #[tokio::test]
    async fn test_model_failure_fails_the_agent() {
        let llm = ScriptedLlm::scripted(vec![Err("quota exceeded".to_string())]);
        let mesh = MeshBuilder::new(Config::default())
            .register(llm.node("llm"))
            .register(Arc::new(
                ChatAgent::new("chat", "llm")
                    .with_config(|c| c.master().retries(1).retry_delay(Duration::ZERO)),
            ))
            .build()
            .await
            .unwrap();

        let response = mesh.chat(ChatPayload::new("hi")).await;
        assert_eq!(response.state, NodeState::Failed);
        assert_eq!(response.attempts, 2);
        assert!(!response.text().contains("quota"));
        assert_eq!(llm.calls(), 2);
    }
}
