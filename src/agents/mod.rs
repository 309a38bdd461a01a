//! Agents - nodes that reason and call other nodes.
//!
//! # Agent Types
//! - **ReActAgent**: reason → act → observe loop over permitted tools
//! - **ParallelAgent**: fans one query out to peers and synthesises their outputs
//! - **ChatAgent**: single model call with conversation memory
//! - **WorkflowAgent**: user-supplied async function orchestrating calls
//!
//! Agents reach models and tools only through `Mesh::call`, so every hop
//! gets the same permission, concurrency and retry treatment.

mod chat;
pub mod parser;
mod parallel;
mod react;
mod workflow;

pub use chat::ChatAgent;
pub use parallel::{FailedPeerPolicy, ParallelAgent};
pub use react::{InputHook, MemoryMode, OutputHook, ReActAgent, ReplyParser, WeightedMemory};
pub use workflow::{WorkflowAgent, WorkflowFn};

use serde_json::{json, Map, Value};

use crate::engine::{Mesh, NodeError};
use crate::envelope::{NodeState, Request, Response};
use crate::llm::ChatMessage;
use crate::memory::Turn;

/// Argument key under which pre-processing stores loaded history.
pub(crate) const SHORT_MEMORY_KEY: &str = "short_memory";

/// Load earlier turns of this caller/callee session into the request.
///
/// A failing store degrades to an empty history.
pub(crate) async fn attach_history(mut request: Request, mesh: &Mesh, limit: usize) -> Request {
    let Some(history) = mesh.history() else {
        return request;
    };
    if request.root_trace_ids.is_empty() || limit == 0 {
        return request;
    }
    match history
        .load_history(&request.root_trace_ids, &request.session_name(), limit)
        .await
    {
        Ok(turns) if !turns.is_empty() => {
            tracing::debug!(
                session = %request.session_name(),
                turns = turns.len(),
                "Loaded conversation history"
            );
            match serde_json::to_value(&turns) {
                Ok(value) => {
                    request.arguments.insert(SHORT_MEMORY_KEY.to_string(), value);
                }
                Err(e) => tracing::warn!("Failed to encode history: {}", e),
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to load history: {:#}", e),
    }
    request
}

/// Turns attached by [`attach_history`].
pub(crate) fn attached_history(request: &Request) -> Vec<Turn> {
    request
        .arguments
        .get(SHORT_MEMORY_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Arguments for a model node call.
pub(crate) fn llm_arguments(messages: &[ChatMessage], llm_params: Option<&Value>) -> Map<String, Value> {
    let mut arguments = Map::new();
    arguments.insert("messages".to_string(), json!(messages));
    if let Some(params) = llm_params {
        arguments.insert("llm_params".to_string(), params.clone());
    }
    arguments
}

/// Map a model response to its text, propagating cancellation.
pub(crate) fn completed_text(response: &Response) -> Result<Option<String>, NodeError> {
    match response.state {
        NodeState::Completed => Ok(Some(response.text())),
        NodeState::Cancelled => Err(NodeError::Cancelled),
        NodeState::Failed | NodeState::Rejected => Ok(None),
    }
}
