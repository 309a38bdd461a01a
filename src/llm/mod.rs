//! LLM client module for interacting with language models.
//!
//! This module provides a trait-based abstraction over model providers, an
//! OpenAI-compatible HTTP implementation, and [`LlmNode`], which exposes a
//! client as a mesh node so model calls get the same lifecycle (concurrency
//! limit, timeout, retries) as every other node.

mod error;
mod http;

pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use http::HttpLlmClient;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::engine::{Mesh, NodeError};
use crate::envelope::{Output, Request};
use crate::events::Event;
use crate::node::{Node, NodeConfig, NodeKind};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Response from a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    /// Separate reasoning channel some providers return
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

/// Optional parameters for chat completions.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Top-p nucleus sampling.
    pub top_p: Option<f64>,
    /// Maximum output tokens to generate.
    pub max_tokens: Option<u64>,
    /// Provider-specific parameters passed through verbatim.
    pub extra: Map<String, Value>,
}

impl ChatOptions {
    /// Overlay request-level `llm_params` on top of these options.
    pub fn merged(&self, params: Option<&Map<String, Value>>) -> Self {
        let mut merged = self.clone();
        let Some(params) = params else {
            return merged;
        };
        for (key, value) in params {
            match key.as_str() {
                "temperature" => merged.temperature = value.as_f64(),
                "top_p" => merged.top_p = value.as_f64(),
                "max_tokens" => merged.max_tokens = value.as_u64(),
                // Streaming is a node setting, not a provider parameter.
                "stream" => {}
                _ => {
                    merged.extra.insert(key.clone(), value.clone());
                }
            }
        }
        merged
    }
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatResponse>;

    /// Send a chat completion request, delivering text fragments through
    /// `deltas` as they arrive.
    ///
    /// Default implementation delivers the full response as one fragment.
    async fn chat_completion_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        deltas: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<ChatResponse> {
        let response = self.chat_completion(model, messages, options).await?;
        if let Some(content) = &response.content {
            let _ = deltas.send(content.clone());
        }
        Ok(response)
    }
}

/// A model endpoint exposed as a mesh node.
///
/// # Arguments
/// - `messages`: list of `{role, content}`; when absent, `query` is sent as a
///   single user message
/// - `llm_params`: per-call overrides of the node's options
pub struct LlmNode {
    config: NodeConfig,
    client: Arc<dyn LlmClient>,
    model: String,
    options: ChatOptions,
    stream: bool,
}

impl LlmNode {
    pub fn new(name: impl Into<String>, client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        let config = NodeConfig::new(name)
            .description("Language model endpoint")
            .send_tool_call(false)
            .send_observation(false);
        Self {
            config,
            client,
            model: model.into(),
            options: ChatOptions::default(),
            stream: false,
        }
    }

    /// Replace the lifecycle configuration, keeping the node's name.
    pub fn with_config(mut self, f: impl FnOnce(NodeConfig) -> NodeConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Deliver partial output as `Event::StreamDelta` while generating.
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn messages_from(request: &Request) -> Result<Vec<ChatMessage>, NodeError> {
        match request.arguments.get("messages") {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(vec![ChatMessage::user(request.query())]),
        }
    }
}

#[async_trait]
impl Node for LlmNode {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Llm
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "messages": {
                    "type": "array",
                    "description": "Chat messages with role and content"
                },
                "llm_params": {
                    "type": "object",
                    "description": "Per-call sampling overrides"
                }
            },
            "required": ["messages"]
        })
    }

    async fn execute(&self, request: &Request, mesh: &Mesh) -> Result<Output, NodeError> {
        let messages = Self::messages_from(request)?;
        let options = self
            .options
            .merged(request.arguments.get("llm_params").and_then(Value::as_object));

        tracing::debug!(
            node = %self.config.name,
            model = %self.model,
            messages = messages.len(),
            stream = self.stream,
            "Calling model"
        );

        let result = if self.stream {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let completion = self
                .client
                .chat_completion_stream(&self.model, &messages, &options, tx);
            let forward = async {
                while let Some(content) = rx.recv().await {
                    mesh.notify(Event::StreamDelta {
                        trace_id: request.trace_id.clone(),
                        node_id: request.node_id().to_string(),
                        node: self.config.name.clone(),
                        content,
                    })
                    .await;
                }
            };
            let (result, ()) = tokio::join!(completion, forward);
            result
        } else {
            self.client
                .chat_completion(&self.model, &messages, &options)
                .await
        };

        let response = result.map_err(|e| match e.downcast_ref::<LlmError>() {
            Some(llm_err) if !llm_err.is_transient() => {
                tracing::warn!(node = %self.config.name, "Permanent model error: {}", llm_err);
                NodeError::permanent(llm_err.to_string())
            }
            _ => {
                tracing::warn!(node = %self.config.name, "Model call failed: {:#}", e);
                NodeError::from(e)
            }
        })?;

        let content = response.content.unwrap_or_default();
        let mut output = Output::new(content);
        if let Some(reasoning) = response.reasoning.filter(|r| !r.is_empty()) {
            output = output.with_extra("reasoning", reasoning);
        }
        if let Some(usage) = response.usage {
            output = output.with_extra("usage", serde_json::to_value(usage)?);
        }
        output = output.with_extra("model", response.model.unwrap_or_else(|| self.model.clone()));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_merge() {
        let base = ChatOptions {
            temperature: Some(0.3),
            max_tokens: Some(2048),
            ..Default::default()
        };
        let params = json!({"temperature": 0.01, "stream": true, "enable_thinking": false});
        let merged = base.merged(params.as_object());
        assert_eq!(merged.temperature, Some(0.01));
        assert_eq!(merged.max_tokens, Some(2048));
        assert!(!merged.extra.contains_key("stream"));
        assert_eq!(merged.extra["enable_thinking"], json!(false));
    }

    #[tokio::test]
    async fn test_streaming_node_emits_deltas() {
        use crate::config::Config;
        use crate::envelope::Category;
        use crate::events::ChannelSink;
        use crate::registry::MeshBuilder;
        use crate::testing::{args, ScriptedLlm};

        let llm = ScriptedLlm::new(["streamed answer"]);
        let (tx, mut rx) = mpsc::channel(8);
        let mesh = MeshBuilder::new(Config::default())
            .register(Arc::new(
                LlmNode::new("llm", llm.clone() as Arc<dyn LlmClient>, "scripted").streaming(true),
            ))
            .sink(Arc::new(ChannelSink::new(tx)))
            .build()
            .await
            .unwrap();

        // No `messages`: the query becomes one user message
        let response = mesh
            .invoke(Request::root("llm", Category::Llm, args(json!({"query": "hi"}))))
            .await;
        assert_eq!(response.text(), "streamed answer");
        assert_eq!(response.extra["model"], json!("scripted"));
        assert_eq!(llm.seen()[0], vec![ChatMessage::user("hi")]);

        match rx.try_recv().unwrap() {
            Event::StreamDelta { node, content, .. } => {
                assert_eq!(node, "llm");
                assert_eq!(content, "streamed answer");
            }
            other => panic!("expected stream delta, got {:?}", other),
        }
    }

    /// Client that fails every call with the given HTTP status.
    struct RefusingLlm {
        status: u16,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for RefusingLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> anyhow::Result<ChatResponse> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(LlmError::from_status(self.status, "refused".to_string()).into())
        }
    }

    async fn invoke_refusing(status: u16) -> (crate::envelope::Response, usize) {
        use crate::config::Config;
        use crate::envelope::Category;
        use crate::registry::MeshBuilder;
        use crate::testing::args;
        use std::time::Duration;

        let client = Arc::new(RefusingLlm {
            status,
            calls: Default::default(),
        });
        let mesh = MeshBuilder::new(Config::default())
            .register(Arc::new(
                LlmNode::new("llm", client.clone() as Arc<dyn LlmClient>, "m")
                    .with_config(|c| c.retries(2).retry_delay(Duration::ZERO)),
            ))
            .build()
            .await
            .unwrap();
        let response = mesh
            .invoke(Request::root("llm", Category::Llm, args(json!({"query": "hi"}))))
            .await;
        let calls = client.calls.load(std::sync::atomic::Ordering::SeqCst);
        (response, calls)
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        use crate::engine::ErrorKind;
        use crate::envelope::NodeState;

        let (response, calls) = invoke_refusing(401).await;
        assert_eq!(response.state, NodeState::Failed);
        assert_eq!(response.error_kind(), Some(ErrorKind::PermanentFailure));
        assert_eq!(response.attempts, 1);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let (response, calls) = invoke_refusing(503).await;
        assert_eq!(response.attempts, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_message_roles_serialize_lowercase() {
        let v = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(v, json!({"role": "assistant", "content": "hi"}));
    }
}
