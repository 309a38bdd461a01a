//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::engine::{Mesh, NodeError};
use crate::envelope::{Output, Request};
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmNode};
use crate::node::{Node, NodeConfig, NodeKind, NodeRef};

/// JSON object literal to argument map.
pub fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

enum Behavior {
    Reply(Value),
    Fail,
    Sleep(Duration),
}

/// Tool node with scripted behavior that counts attempts and tracks peak
/// concurrency.
pub struct TestNode {
    config: NodeConfig,
    behavior: Behavior,
    attempts: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl TestNode {
    fn with_behavior(config: NodeConfig, behavior: Behavior) -> Self {
        Self {
            config,
            behavior,
            attempts: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ok(config: NodeConfig, reply: impl Into<Value>) -> Self {
        Self::with_behavior(config, Behavior::Reply(reply.into()))
    }

    pub fn failing(config: NodeConfig) -> Self {
        Self::with_behavior(config, Behavior::Fail)
    }

    pub fn sleeping(config: NodeConfig, duration: Duration) -> Self {
        Self::with_behavior(config, Behavior::Sleep(duration))
    }

    pub fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }

    pub fn peak(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }
}

#[async_trait]
impl Node for TestNode {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    async fn execute(&self, _request: &Request, _mesh: &Mesh) -> Result<Output, NodeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = match &self.behavior {
            Behavior::Reply(value) => Ok(Output::new(value.clone())),
            Behavior::Fail => Err(NodeError::transient(format!("{} is broken", self.config.name))),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(Output::from("slept"))
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Model client that replays scripted replies in order, repeating the last
/// one once the script runs out.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::scripted(replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    /// Script mixing replies (`Ok`) and failures (`Err`).
    pub fn scripted(script: Vec<Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message lists received, one per call.
    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }

    /// Wrap this client in a model node that does not retry.
    pub fn node(self: &Arc<Self>, name: &str) -> NodeRef {
        Arc::new(
            LlmNode::new(name, Arc::clone(self) as Arc<dyn LlmClient>, "scripted")
                .with_config(|c| c.retries(0)),
        )
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());

        let next = self.script.lock().unwrap().pop_front();
        let reply = match next {
            Some(reply) => {
                *self.last.lock().unwrap() = Some(reply.clone());
                reply
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(String::new())),
        };

        match reply {
            Ok(content) => Ok(ChatResponse {
                content: Some(content),
                ..Default::default()
            }),
            Err(message) => Err(anyhow::anyhow!(message)),
        }
    }
}
