//! Request/response envelopes passed between nodes.
//!
//! # Invariants
//! - `call_stack.len() == node_id_stack.len()` for every request (enforced by
//!   the constructors; the stacks are not publicly mutable)
//! - A child request's call stack is its parent's with exactly one name appended
//! - A response's call stack equals the call stack of the request it answers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{ErrorKind, NodeError};

/// Name of the implicit root caller.
pub const USER: &str = "user";

/// Generate a fresh identifier.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Class of either end of a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    User,
    Agent,
    Tool,
    Llm,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::User => write!(f, "user"),
            Category::Agent => write!(f, "agent"),
            Category::Tool => write!(f, "tool"),
            Category::Llm => write!(f, "llm"),
        }
    }
}

/// Input of one node invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Identifier of the top-level chat this hop belongs to
    pub request_id: String,

    /// Trace of the current top-level invocation (shared by every hop)
    pub trace_id: String,

    /// Lineage of earlier traces this conversation continues
    pub root_trace_ids: Vec<String>,

    /// Conversation group, inherited across traces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    pub caller: String,
    pub caller_category: Category,
    pub callee: String,
    pub callee_category: Category,

    call_stack: Vec<String>,
    node_id_stack: Vec<String>,

    /// Arguments interpreted by the target node
    pub arguments: Map<String, Value>,

    /// Shared by siblings created by one fan-out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_id: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Cooperative cancellation for this hop and its children
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl Request {
    /// Create a top-level request from the user to `callee`.
    ///
    /// # Postcondition
    /// `call_stack == ["user", callee]`
    pub fn root(
        callee: impl Into<String>,
        callee_category: Category,
        arguments: Map<String, Value>,
    ) -> Self {
        let callee = callee.into();
        let trace_id = new_id();
        Self {
            request_id: new_id(),
            call_stack: vec![USER.to_string(), callee.clone()],
            node_id_stack: vec![trace_id.clone(), new_id()],
            trace_id,
            root_trace_ids: Vec::new(),
            group_id: None,
            caller: USER.to_string(),
            caller_category: Category::User,
            callee,
            callee_category,
            arguments,
            parallel_id: None,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Build the request for a call from this node to `callee`.
    ///
    /// Trace identifiers and lineage are inherited unchanged; only the
    /// top-level entry point sets them.
    pub fn child(
        &self,
        callee: impl Into<String>,
        callee_category: Category,
        arguments: Map<String, Value>,
    ) -> Self {
        let callee = callee.into();
        let mut call_stack = self.call_stack.clone();
        call_stack.push(callee.clone());
        let mut node_id_stack = self.node_id_stack.clone();
        node_id_stack.push(new_id());

        Self {
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            root_trace_ids: self.root_trace_ids.clone(),
            group_id: self.group_id.clone(),
            caller: self.callee.clone(),
            caller_category: self.callee_category,
            callee,
            callee_category,
            call_stack,
            node_id_stack,
            arguments,
            parallel_id: None,
            created_at: Utc::now(),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_lineage(mut self, root_trace_ids: Vec<String>) -> Self {
        self.root_trace_ids = root_trace_ids;
        self
    }

    pub fn with_group_id(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_parallel_id(mut self, parallel_id: impl Into<String>) -> Self {
        self.parallel_id = Some(parallel_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Node names from the root caller to this hop.
    pub fn call_stack(&self) -> &[String] {
        &self.call_stack
    }

    /// Per-hop identifiers, parallel to `call_stack`.
    pub fn node_id_stack(&self) -> &[String] {
        &self.node_id_stack
    }

    /// Identity of this hop.
    pub fn node_id(&self) -> &str {
        self.node_id_stack.last().map(String::as_str).unwrap_or_default()
    }

    /// Number of names on the call stack.
    pub fn depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn is_from_user(&self) -> bool {
        self.caller_category == Category::User
    }

    /// Session key used to thread history between this caller and callee.
    pub fn session_name(&self) -> String {
        format!("{}__{}", self.caller, self.callee)
    }

    /// The textual query carried in `arguments["query"]`.
    ///
    /// Accepts either a plain string or a list of parts shaped like
    /// `{"part": {"content_type": "text/plain", "data": "..."}}`; only text
    /// parts contribute.
    pub fn query(&self) -> String {
        match self.arguments.get("query") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| {
                    let part = p.get("part").unwrap_or(p);
                    let content_type = part
                        .get("content_type")
                        .and_then(Value::as_str)
                        .unwrap_or("text/plain");
                    if content_type.starts_with("text") {
                        part.get("data").and_then(Value::as_str)
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    pub fn set_query(&mut self, query: impl Into<String>) {
        self.arguments
            .insert("query".to_string(), Value::String(query.into()));
    }
}

/// Value produced by a node's work operation.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub value: Value,
    pub extra: Map<String, Value>,
}

impl Output {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            extra: Map::new(),
        }
    }

    /// Attach side-channel metadata.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl From<String> for Output {
    fn from(s: String) -> Self {
        Self::new(Value::String(s))
    }
}

impl From<&str> for Output {
    fn from(s: &str) -> Self {
        Self::new(Value::String(s.to_string()))
    }
}

impl From<Value> for Output {
    fn from(v: Value) -> Self {
        Self::new(v)
    }
}

/// Terminal state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Work operation succeeded
    Completed,
    /// Work operation ran and its attempts were exhausted
    Failed,
    /// Refused before the work operation ran (permission, unknown callee, depth)
    Rejected,
    /// Cancellation signal observed
    Cancelled,
}

/// Failure classification attached to non-completed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    /// Human-readable summary
    pub message: String,
    /// Raw error text, kept for trace records only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Output of one node invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub state: NodeState,
    pub output: Value,
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    pub request_id: String,
    pub trace_id: String,
    pub callee: String,
    call_stack: Vec<String>,
    node_id_stack: Vec<String>,

    /// Number of work-operation attempts made
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl Response {
    fn base(request: &Request, state: NodeState, output: Value, attempts: u32) -> Self {
        Self {
            state,
            output,
            extra: Map::new(),
            error: None,
            request_id: request.request_id.clone(),
            trace_id: request.trace_id.clone(),
            callee: request.callee.clone(),
            call_stack: request.call_stack.clone(),
            node_id_stack: request.node_id_stack.clone(),
            attempts,
            finished_at: Utc::now(),
        }
    }

    /// Create a completed response.
    pub fn completed(request: &Request, output: Output, attempts: u32) -> Self {
        let mut response = Self::base(request, NodeState::Completed, output.value, attempts);
        response.extra = output.extra;
        response
    }

    /// Create a failed response after the work operation ran.
    ///
    /// The output carries a generic message; the raw error is kept in
    /// `error.detail`.
    pub fn failed(request: &Request, error: &NodeError, attempts: u32) -> Self {
        let message = format!(
            "{} failed after {} attempt(s): {}",
            request.callee,
            attempts,
            error.kind()
        );
        let mut response = Self::base(
            request,
            NodeState::Failed,
            Value::String(message.clone()),
            attempts,
        );
        response.error = Some(ErrorInfo {
            kind: error.kind(),
            message,
            detail: Some(error.to_string()),
        });
        response
    }

    /// Create a response refused before the work operation ran.
    pub fn rejected(request: &Request, error: &NodeError) -> Self {
        let message = error.to_string();
        let mut response =
            Self::base(request, NodeState::Rejected, Value::String(message.clone()), 0);
        response.error = Some(ErrorInfo {
            kind: error.kind(),
            message,
            detail: None,
        });
        response
    }

    /// Create a cancelled response.
    pub fn cancelled(request: &Request, attempts: u32) -> Self {
        let message = format!("{} was cancelled", request.callee);
        let mut response = Self::base(
            request,
            NodeState::Cancelled,
            Value::String(message.clone()),
            attempts,
        );
        response.error = Some(ErrorInfo {
            kind: ErrorKind::Cancelled,
            message,
            detail: None,
        });
        response
    }

    pub fn is_completed(&self) -> bool {
        self.state == NodeState::Completed
    }

    pub fn call_stack(&self) -> &[String] {
        &self.call_stack
    }

    pub fn node_id_stack(&self) -> &[String] {
        &self.node_id_stack
    }

    /// Classification of the failure, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Output rendered as text (strings verbatim, other values as JSON).
    pub fn text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_root_request_stacks() {
        let req = Request::root("master", Category::Agent, Map::new());
        assert_eq!(req.call_stack(), ["user", "master"]);
        assert_eq!(req.node_id_stack().len(), 2);
        assert_eq!(req.caller, USER);
        assert!(req.is_from_user());
    }

    #[test]
    fn test_child_appends_exactly_one() {
        let root = Request::root("master", Category::Agent, Map::new())
            .with_lineage(vec!["t0".into()])
            .with_group_id(Some("g".into()));
        let child = root.child("calc", Category::Tool, args(json!({"a": 1})));

        assert_eq!(child.call_stack(), ["user", "master", "calc"]);
        assert_eq!(child.node_id_stack()[..2], root.node_id_stack()[..]);
        assert_eq!(child.node_id_stack().len(), child.call_stack().len());
        assert_eq!(child.caller, "master");
        assert_eq!(child.caller_category, Category::Agent);
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.root_trace_ids, root.root_trace_ids);
        assert_eq!(child.group_id.as_deref(), Some("g"));
        assert_ne!(child.node_id(), root.node_id());
    }

    #[test]
    fn test_child_cancellation_follows_parent() {
        let root = Request::root("master", Category::Agent, Map::new());
        let child = root.child("calc", Category::Tool, Map::new());
        root.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }

    #[test]
    fn test_query_from_parts() {
        let req = Request::root(
            "master",
            Category::Agent,
            args(json!({"query": [
                {"part": {"content_type": "path", "data": "sample.docx"}},
                {"part": {"content_type": "text/plain", "data": "Summarize it."}}
            ]})),
        );
        assert_eq!(req.query(), "Summarize it.");
    }

    #[test]
    fn test_failed_response_hides_detail() {
        let req = Request::root("calc", Category::Tool, Map::new());
        let resp = Response::failed(&req, &NodeError::transient("db password=hunter2"), 3);
        assert_eq!(resp.state, NodeState::Failed);
        assert!(!resp.text().contains("hunter2"));
        assert_eq!(resp.call_stack(), req.call_stack());
        let info = resp.error.unwrap();
        assert_eq!(info.kind, ErrorKind::TransientFailure);
        assert!(info.detail.unwrap().contains("hunter2"));
    }
}
