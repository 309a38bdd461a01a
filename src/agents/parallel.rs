//! Parallel dispatcher - fan one query out to peers, then synthesise.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{completed_text, llm_arguments};
use crate::engine::{Mesh, NodeError};
use crate::envelope::{Output, Request, Response};
use crate::llm::ChatMessage;
use crate::node::{Node, NodeConfig, NodeKind};

const SYNTHESIS_PROMPT: &str = "Several assistants answered the same question independently. \
Combine their answers into one complete, consistent reply. Resolve contradictions where \
possible and do not mention the assistants.";

/// What to do with a peer whose invocation did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailedPeerPolicy {
    /// Embed the failed peer's output text as-is
    #[default]
    IncludeVerbatim,
    /// Drop the peer and add a note naming it
    ExcludeWithNote,
}

/// Agent that sends its arguments to every peer concurrently and merges the
/// answers with one model call.
pub struct ParallelAgent {
    config: NodeConfig,
    peers: Vec<String>,
    llm_name: String,
    policy: FailedPeerPolicy,
    prompt: String,
    llm_params: Option<Value>,
}

impl ParallelAgent {
    pub fn new<I, S>(name: impl Into<String>, peers: I, llm_name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let peers: Vec<String> = peers.into_iter().map(Into::into).collect();
        let llm_name = llm_name.into();
        Self {
            config: NodeConfig::new(name)
                .description("Asks several agents the same question and merges their answers")
                .permit(peers.iter().cloned())
                .permit([llm_name.clone()]),
            peers,
            llm_name,
            policy: FailedPeerPolicy::default(),
            prompt: SYNTHESIS_PROMPT.to_string(),
            llm_params: None,
        }
    }

    pub fn with_config(mut self, f: impl FnOnce(NodeConfig) -> NodeConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn policy(mut self, policy: FailedPeerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the synthesis system prompt.
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn llm_params(mut self, params: Value) -> Self {
        self.llm_params = Some(params);
        self
    }

    /// Synthesis input: one section per peer answer, plus the failure note.
    fn synthesis_input(&self, query: &str, results: &[(&String, Response)]) -> String {
        let mut sections = Vec::new();
        let mut failed = Vec::new();

        for (peer, response) in results {
            if response.is_completed() {
                sections.push(format!("[{}]\n{}", peer, response.text()));
                continue;
            }
            failed.push(peer.as_str());
            if self.policy == FailedPeerPolicy::IncludeVerbatim {
                sections.push(format!("[{}]\n{}", peer, response.text()));
            }
        }

        let mut input = format!("Question: {}\n\nAnswers:\n\n{}", query, sections.join("\n\n"));
        if self.policy == FailedPeerPolicy::ExcludeWithNote && !failed.is_empty() {
            input.push_str(&format!(
                "\n\nNote: {} of {} assistants failed and were left out: {}",
                failed.len(),
                results.len(),
                failed.join(", ")
            ));
        }
        input
    }
}

#[async_trait]
impl Node for ParallelAgent {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Agent
    }

    async fn execute(&self, request: &Request, mesh: &Mesh) -> Result<Output, NodeError> {
        let calls = self
            .peers
            .iter()
            .map(|peer| (peer.clone(), request.arguments.clone()))
            .collect();
        let responses = mesh.call_parallel(request, calls).await;

        if request.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let results: Vec<(&String, Response)> = self.peers.iter().zip(responses).collect();
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, response)| !response.is_completed())
            .map(|(peer, _)| peer.as_str())
            .collect();
        let total = results.len();

        if !failed.is_empty() {
            tracing::warn!(
                agent = %self.name(),
                failed = ?failed,
                total,
                "Some peers did not complete"
            );
        }
        if self.policy == FailedPeerPolicy::ExcludeWithNote && failed.len() == total {
            return Err(NodeError::PartialFailure {
                failed: failed.len(),
                total,
            });
        }

        let messages = vec![
            ChatMessage::system(self.prompt.clone()),
            ChatMessage::user(self.synthesis_input(&request.query(), &results)),
        ];
        let response = mesh
            .call(
                request,
                &self.llm_name,
                llm_arguments(&messages, self.llm_params.as_ref()),
            )
            .await;
        let answer = completed_text(&response)?.ok_or_else(|| {
            NodeError::transient(format!("synthesis failed: {}", response.text()))
        })?;

        let mut output = Output::new(answer).with_extra("peers", json!(self.peers));
        if !failed.is_empty() {
            output = output.with_extra(
                "partial_failure",
                json!({"failed": failed.len(), "total": total, "peers": failed}),
            );
        }
        Ok(output)
    }
}
