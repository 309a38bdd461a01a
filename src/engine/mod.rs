//! Execution lifecycle engine.
//!
//! Every node invocation, whatever its kind, goes through [`Mesh::invoke`]:
//!
//! 1. Depth guard
//! 2. Pre-processing hook, then history `save_pre_request` for persisting nodes
//! 3. Pre-send `ToolCall` notification
//! 4. Permission check (terminal, never retried; the pending `ToolCall` is
//!    closed with a rejected `Observation`)
//! 5. Acquire one concurrency slot (cancellation-aware)
//! 6. Retry loop: `retries + 1` attempts, each under `timeout`
//! 7. Release the slot
//! 8. Post-processing hook, then history `save_response`
//! 9. Post-send `Observation` notification
//!
//! `invoke` never returns an error; every path ends in a [`Response`].

mod error;

pub use error::{ErrorKind, NodeError};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::envelope::{new_id, Category, Request, Response};
use crate::events::{Event, MessageSink};
use crate::memory::HistoryStore;
use crate::node::{NodeRef, ProviderRef};
use crate::registry::{NodeEntry, NodeRegistry};

/// Top-level chat input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Plain text or a list of content parts
    pub query: Value,

    /// Additional arguments passed to the target node
    #[serde(default)]
    pub arguments: Map<String, Value>,

    /// Caller-supplied identifier; generated when absent
    #[serde(default)]
    pub request_id: Option<String>,

    /// Earlier trace this chat continues
    #[serde(default)]
    pub from_trace_id: Option<String>,

    /// Conversation group; inherited from `from_trace_id` when absent
    #[serde(default)]
    pub group_id: Option<String>,

    /// Target node; the master node when absent
    #[serde(default)]
    pub node: Option<String>,
}

impl ChatPayload {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: Value::String(query.into()),
            ..Default::default()
        }
    }

    pub fn continuing(mut self, from_trace_id: impl Into<String>) -> Self {
        self.from_trace_id = Some(from_trace_id.into());
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn target(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

#[derive(Debug, Clone)]
struct TraceRecord {
    root_trace_ids: Vec<String>,
    group_id: Option<String>,
}

/// Lineage of recent chats, oldest evicted first once `capacity` is reached.
#[derive(Debug)]
struct TraceTable {
    capacity: usize,
    records: HashMap<String, TraceRecord>,
    order: VecDeque<String>,
}

impl TraceTable {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, trace_id: &str) -> Option<&TraceRecord> {
        self.records.get(trace_id)
    }

    fn insert(&mut self, trace_id: String, record: TraceRecord) {
        if self.records.insert(trace_id.clone(), record).is_none() {
            self.order.push_back(trace_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.records.len()
    }
}

struct MeshInner {
    config: Arc<Config>,
    registry: NodeRegistry,
    providers: Vec<ProviderRef>,
    history: Option<Arc<dyn HistoryStore>>,
    sink: Option<Arc<dyn MessageSink>>,
    global_data: RwLock<Map<String, Value>>,
    traces: RwLock<TraceTable>,
}

/// A built set of nodes sharing one lifecycle engine.
///
/// Cheap to clone; clones share the registry and collaborators.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    pub(crate) fn new(
        config: Config,
        registry: NodeRegistry,
        providers: Vec<ProviderRef>,
        history: Option<Arc<dyn HistoryStore>>,
        sink: Option<Arc<dyn MessageSink>>,
    ) -> Self {
        let traces = TraceTable::new(config.trace_capacity);
        Self {
            inner: Arc::new(MeshInner {
                config: Arc::new(config),
                registry,
                providers,
                history,
                sink,
                global_data: RwLock::new(Map::new()),
                traces: RwLock::new(traces),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn history(&self) -> Option<&Arc<dyn HistoryStore>> {
        self.inner.history.as_ref()
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<NodeRef> {
        self.inner.registry.get(name).map(|e| Arc::clone(&e.node))
    }

    /// Category of a registered node (tool for unknown names).
    fn category_of(&self, name: &str) -> Category {
        self.inner
            .registry
            .get(name)
            .map(|e| e.node.kind().category())
            .unwrap_or(Category::Tool)
    }

    /// Start a top-level chat.
    pub async fn chat(&self, payload: ChatPayload) -> Response {
        self.chat_with_cancel(payload, CancellationToken::new()).await
    }

    /// Start a top-level chat that stops when `cancel` fires.
    pub async fn chat_with_cancel(&self, payload: ChatPayload, cancel: CancellationToken) -> Response {
        let target = payload
            .node
            .clone()
            .or_else(|| self.inner.registry.master().map(str::to_string))
            .unwrap_or_default();

        let (root_trace_ids, inherited_group) = match &payload.from_trace_id {
            Some(from) => {
                let traces = self.inner.traces.read().await;
                match traces.get(from) {
                    Some(record) => {
                        let mut lineage = record.root_trace_ids.clone();
                        lineage.push(from.clone());
                        (lineage, record.group_id.clone())
                    }
                    None => (vec![from.clone()], None),
                }
            }
            None => (Vec::new(), None),
        };
        let group_id = payload.group_id.clone().or(inherited_group);

        let mut arguments = payload.arguments;
        arguments.insert("query".to_string(), payload.query);

        let mut request = Request::root(&target, self.category_of(&target), arguments)
            .with_lineage(root_trace_ids.clone())
            .with_group_id(group_id.clone())
            .with_cancel(cancel);
        if let Some(request_id) = payload.request_id {
            request = request.with_request_id(request_id);
        }

        self.inner.traces.write().await.insert(
            request.trace_id.clone(),
            TraceRecord {
                root_trace_ids,
                group_id,
            },
        );

        tracing::info!(
            request_id = %request.request_id,
            trace_id = %request.trace_id,
            node = %target,
            lineage = request.root_trace_ids.len(),
            "Starting chat"
        );

        let response = self.invoke(request).await;

        self.notify(Event::Answer {
            trace_id: response.trace_id.clone(),
            request_id: response.request_id.clone(),
            state: response.state,
            output: response.output.clone(),
        })
        .await;

        response
    }

    /// Call `callee` on behalf of the node handling `current`.
    pub async fn call(&self, current: &Request, callee: &str, arguments: Map<String, Value>) -> Response {
        let child = current.child(callee, self.category_of(callee), arguments);
        self.invoke(child).await
    }

    /// Call several nodes concurrently; all children share one `parallel_id`.
    ///
    /// Responses are returned in the order of `calls`.
    pub async fn call_parallel(
        &self,
        current: &Request,
        calls: Vec<(String, Map<String, Value>)>,
    ) -> Vec<Response> {
        let parallel_id = new_id();
        tracing::debug!(
            caller = %current.callee,
            parallel_id = %parallel_id,
            fan_out = calls.len(),
            "Dispatching parallel calls"
        );
        let futures = calls.into_iter().map(|(callee, arguments)| {
            let child = current
                .child(&callee, self.category_of(&callee), arguments)
                .with_parallel_id(parallel_id.clone());
            self.invoke(child)
        });
        join_all(futures).await
    }

    /// Run the full lifecycle for `request.callee`.
    pub async fn invoke(&self, request: Request) -> Response {
        let span = tracing::info_span!(
            "invoke",
            node = %request.callee,
            caller = %request.caller,
            trace_id = %request.trace_id,
            node_id = %request.node_id(),
            depth = request.depth(),
        );
        self.run_lifecycle(request).instrument(span).await
    }

    async fn run_lifecycle(&self, request: Request) -> Response {
        let Some(entry) = self.inner.registry.get(&request.callee) else {
            let err = NodeError::NotFound(request.callee.clone());
            tracing::warn!("{}", err);
            return Response::rejected(&request, &err);
        };
        let node = Arc::clone(&entry.node);
        let config = node.config();

        // 1. Depth guard
        let max_depth = self.inner.config.max_call_depth;
        if request.depth() > max_depth {
            let err = NodeError::DepthExceeded {
                depth: request.depth(),
                max: max_depth,
            };
            tracing::warn!("{}", err);
            return Response::rejected(&request, &err);
        }

        // 2. Pre-processing
        let snapshot = request.clone();
        let request = match node.pre_process(request, self).await {
            Ok(processed)
                if processed.call_stack() == snapshot.call_stack()
                    && processed.node_id_stack() == snapshot.node_id_stack() =>
            {
                processed
            }
            Ok(_) => {
                tracing::warn!("Pre-processing hook altered the call stack; discarding its changes");
                snapshot
            }
            Err(NodeError::Cancelled) => return Response::cancelled(&snapshot, 0),
            Err(e) => {
                tracing::warn!("Pre-processing failed: {}", e);
                return Response::rejected(&snapshot, &e);
            }
        };
        if config.persist {
            self.save_pre_request(&request).await;
        }

        // 3. Pre-send
        if config.send_tool_call && !request.is_from_user() {
            self.notify(Event::ToolCall {
                trace_id: request.trace_id.clone(),
                node_id: request.node_id().to_string(),
                caller: request.caller.clone(),
                callee: request.callee.clone(),
                arguments: request.arguments.clone(),
                parallel_id: request.parallel_id.clone(),
            })
            .await;
        }

        // 4. Permission
        if config.is_permission_required
            && !request.is_from_user()
            && !self.inner.registry.is_permitted(&request.caller, &request.callee)
        {
            let err = NodeError::PermissionDenied {
                caller: request.caller.clone(),
                callee: request.callee.clone(),
            };
            tracing::warn!("{}", err);
            let response = Response::rejected(&request, &err);
            if config.send_tool_call {
                self.send_observation(&request, &response).await;
            }
            return response;
        }

        // 5-7. Slot + retry loop
        let response = self.execute_with_retry(entry, &request).await;

        // 8. Post-processing
        let response = node.post_process(response, &request, self).await;
        if config.persist {
            self.save_response(&request, &response).await;
        }

        // 9. Post-send
        if config.send_observation && !request.is_from_user() {
            self.send_observation(&request, &response).await;
        }

        response
    }

    async fn send_observation(&self, request: &Request, response: &Response) {
        self.notify(Event::Observation {
            trace_id: request.trace_id.clone(),
            node_id: request.node_id().to_string(),
            callee: request.callee.clone(),
            state: response.state,
            output: response.output.clone(),
        })
        .await;
    }

    async fn execute_with_retry(&self, entry: &NodeEntry, request: &Request) -> Response {
        let node = &entry.node;
        let config = node.config();
        let cancel = &request.cancel;

        let acquire = Arc::clone(&entry.slots).acquire_owned();
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Cancelled while waiting for an execution slot");
                return Response::cancelled(request, 0);
            }
            permit = acquire => match permit {
                Ok(permit) => permit,
                Err(_closed) => {
                    let err = NodeError::transient("execution slots closed");
                    return Response::failed(request, &err, 0);
                }
            }
        };

        let max_attempts = config.max_attempts();
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let attempt = tokio::time::timeout(config.timeout, node.execute(request, self));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(NodeError::Cancelled),
                result = attempt => match result {
                    Ok(result) => result,
                    Err(_elapsed) => Err(NodeError::Timeout(config.timeout)),
                },
            };

            match result {
                Ok(output) => break Ok(output),
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    tracing::warn!(
                        attempt = attempts,
                        max_attempts,
                        "Attempt failed, retrying in {:?}: {}",
                        config.retry_delay,
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Err(NodeError::Cancelled),
                        _ = tokio::time::sleep(config.retry_delay) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(output) => {
                if attempts > 1 {
                    tracing::info!("Succeeded after {} attempts", attempts);
                }
                Response::completed(request, output, attempts)
            }
            Err(NodeError::Cancelled) => {
                tracing::info!("Cancelled after {} attempt(s)", attempts);
                Response::cancelled(request, attempts)
            }
            Err(e) => {
                tracing::error!(attempts, "Node failed: {}", e);
                Response::failed(request, &e, attempts)
            }
        }
    }

    async fn save_pre_request(&self, request: &Request) {
        match &self.inner.history {
            Some(history) => {
                if let Err(e) = history.save_pre_request(request).await {
                    tracing::warn!("Failed to persist request: {:#}", e);
                }
            }
            None => tracing::warn!(node = %request.callee, "Node persists history but no store is configured"),
        }
    }

    async fn save_response(&self, request: &Request, response: &Response) {
        if let Some(history) = &self.inner.history {
            if let Err(e) = history.save_response(request, response).await {
                tracing::warn!("Failed to persist response: {:#}", e);
            }
        }
    }

    /// Deliver an event to the sink, bounded by `send_timeout`. Never fails.
    pub async fn notify(&self, event: Event) {
        let Some(sink) = &self.inner.sink else {
            return;
        };
        let name = event.event_name();
        match tokio::time::timeout(self.inner.config.send_timeout, sink.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(event = name, "Failed to deliver event: {:#}", e),
            Err(_) => tracing::warn!(event = name, "Event delivery timed out"),
        }
    }

    /// Read a value from the mesh-wide store.
    pub async fn get_global(&self, key: &str) -> Option<Value> {
        self.inner.global_data.read().await.get(key).cloned()
    }

    /// Write a value to the mesh-wide store, returning the previous value.
    pub async fn set_global(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.global_data.write().await.insert(key.into(), value)
    }

    /// Release provider resources.
    pub async fn shutdown(&self) {
        for provider in &self.inner.providers {
            tracing::info!(provider = %provider.name(), "Cleaning up capability provider");
            provider.cleanup().await;
        }
    }
}
