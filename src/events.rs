//! Outbound notifications emitted while a mesh executes.
//!
//! Delivery is best-effort: the engine bounds every send with
//! `Config::send_timeout` and only logs failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};

use crate::envelope::NodeState;

/// Execution events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A node is calling another node.
    ToolCall {
        trace_id: String,
        node_id: String,
        caller: String,
        callee: String,
        arguments: Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parallel_id: Option<String>,
    },
    /// A called node produced its output.
    Observation {
        trace_id: String,
        node_id: String,
        callee: String,
        state: NodeState,
        output: Value,
    },
    /// Incremental model output.
    StreamDelta {
        trace_id: String,
        node_id: String,
        node: String,
        content: String,
    },
    /// Reasoning text captured from a model response.
    Reasoning {
        trace_id: String,
        node_id: String,
        node: String,
        content: String,
    },
    /// Final answer of a top-level chat.
    Answer {
        trace_id: String,
        request_id: String,
        state: NodeState,
        output: Value,
    },
}

impl Event {
    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Event::ToolCall { .. } => "tool_call",
            Event::Observation { .. } => "observation",
            Event::StreamDelta { .. } => "stream_delta",
            Event::Reasoning { .. } => "reasoning",
            Event::Answer { .. } => "answer",
        }
    }

    pub fn trace_id(&self) -> &str {
        match self {
            Event::ToolCall { trace_id, .. }
            | Event::Observation { trace_id, .. }
            | Event::StreamDelta { trace_id, .. }
            | Event::Reasoning { trace_id, .. }
            | Event::Answer { trace_id, .. } => trace_id,
        }
    }
}

/// Destination for outbound events.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, event: Event) -> anyhow::Result<()>;
}

/// Fan-out sink backed by a tokio broadcast channel.
///
/// Sending never blocks; events sent while nobody is subscribed are dropped.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl MessageSink for BroadcastSink {
    async fn send(&self, event: Event) -> anyhow::Result<()> {
        // No receivers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Sink backed by a bounded mpsc channel; a full channel applies backpressure.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, event: Event) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let sink = BroadcastSink::new(8);
        let ev = Event::Reasoning {
            trace_id: "t".into(),
            node_id: "n".into(),
            node: "agent".into(),
            content: "thinking".into(),
        };
        assert!(sink.send(ev).await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscriber() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.send(Event::StreamDelta {
            trace_id: "t".into(),
            node_id: "n".into(),
            node: "llm".into(),
            content: "Hel".into(),
        })
        .await
        .unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event_name(), "stream_delta");
        assert_eq!(ev.trace_id(), "t");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = Event::Answer {
            trace_id: "t".into(),
            request_id: "r".into(),
            state: NodeState::Completed,
            output: Value::String("4".into()),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "answer");
        assert_eq!(v["state"], "COMPLETED");
    }
}
