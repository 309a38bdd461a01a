//! Conversation history persistence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::envelope::{NodeState, Request, Response};
use crate::llm::ChatMessage;

/// One completed exchange between a caller and a callee.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub query: String,
    pub answer: String,
    /// In-round reasoning messages (tool calls and observations)
    #[serde(default)]
    pub reasoning: Vec<ChatMessage>,
}

impl Turn {
    pub fn new(query: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            answer: answer.into(),
            reasoning: Vec::new(),
        }
    }

    pub fn with_reasoning(mut self, reasoning: Vec<ChatMessage>) -> Self {
        self.reasoning = reasoning;
        self
    }
}

/// Storage for trace and history records.
///
/// The engine calls `save_pre_request` before and `save_response` after a
/// persisting node runs; agents call `load_history` to thread earlier turns.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn save_pre_request(&self, request: &Request) -> anyhow::Result<()>;

    async fn save_response(&self, request: &Request, response: &Response) -> anyhow::Result<()>;

    /// Completed turns of `session_name` within the given traces, oldest
    /// first, at most `limit` (the most recent ones).
    async fn load_history(
        &self,
        root_trace_ids: &[String],
        session_name: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Turn>>;
}

#[derive(Debug, Clone)]
struct Record {
    node_id: String,
    trace_id: String,
    session_name: String,
    query: String,
    answer: Option<String>,
    reasoning: Vec<ChatMessage>,
}

/// Process-local history store.
#[derive(Default)]
pub struct InMemoryHistory {
    records: RwLock<Vec<Record>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, answered or not.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn save_pre_request(&self, request: &Request) -> anyhow::Result<()> {
        self.records.write().await.push(Record {
            node_id: request.node_id().to_string(),
            trace_id: request.trace_id.clone(),
            session_name: request.session_name(),
            query: request.query(),
            answer: None,
            reasoning: Vec::new(),
        });
        Ok(())
    }

    async fn save_response(&self, request: &Request, response: &Response) -> anyhow::Result<()> {
        // Only completed turns are replayed as history.
        if response.state != NodeState::Completed {
            return Ok(());
        }
        let reasoning: Vec<ChatMessage> = match response.extra.get("react_memory") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };

        let mut records = self.records.write().await;
        let node_id = request.node_id();
        let existing = records.iter().rposition(|r| r.node_id == node_id);
        match existing {
            Some(index) => {
                records[index].answer = Some(response.text());
                records[index].reasoning = reasoning;
            }
            None => records.push(Record {
                node_id: node_id.to_string(),
                trace_id: request.trace_id.clone(),
                session_name: request.session_name(),
                query: request.query(),
                answer: Some(response.text()),
                reasoning,
            }),
        }
        Ok(())
    }

    async fn load_history(
        &self,
        root_trace_ids: &[String],
        session_name: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Turn>> {
        let records = self.records.read().await;
        let mut turns: Vec<Turn> = records
            .iter()
            .filter(|r| r.session_name == session_name && root_trace_ids.contains(&r.trace_id))
            .filter_map(|r| {
                let answer = r.answer.clone()?;
                Some(Turn {
                    query: r.query.clone(),
                    answer,
                    reasoning: r.reasoning.clone(),
                })
            })
            .collect();
        let skip = turns.len().saturating_sub(limit);
        turns.drain(..skip);
        Ok(turns)
    }
}
