//! ReAct agent - iterative reason → act → observe loop.
//!
//! # States
//! - **Reasoning**: build the context and call the model
//! - **Acting/Observing**: dispatch the requested tools concurrently, feed the
//!   merged observation back
//! - **Correcting**: the reply looked like a tool call but did not parse;
//!   append it with a correction and ask again
//! - **Fallback**: the round budget ran out; one synthesis call over the
//!   collected observations, or an assembled answer if that fails
//!
//! # Invariants
//! - At most `max_rounds + 1` model calls per attempt
//! - The fallback never fails and never returns empty text

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::parser::{parse_reply, Action, ParsedReply, ToolCall};
use super::{attach_history, attached_history, completed_text, llm_arguments};
use crate::engine::{Mesh, NodeError};
use crate::envelope::{Output, Request, Response};
use crate::events::Event;
use crate::llm::ChatMessage;
use crate::memory::{replay, select_within_budget, weigh_turns, Memory, SourceWeights, Turn};
use crate::node::{Node, NodeConfig, NodeKind};

const DEFAULT_PROMPT: &str = r#"You are a helpful assistant that can use these tools:
${tools_description}

Choose the appropriate tool based on the user's question.
If no tool is needed, reply directly with the answer.
If a tool is needed, reply ONLY with a JSON object in this exact format:
{"tool_name": "<tool name>", "arguments": {"<parameter>": "<value>"}}
To call several tools at once, reply with a JSON array of such objects.
Add "trust_mode": 1 to a call when its output should be returned to the user verbatim.
After receiving an observation, either call another tool or give the final answer.
${additional_prompt}"#;

const FALLBACK_PROMPT: &str = "You ran out of reasoning steps. Using only the observations \
below, give the best possible final answer to the question. Do not call any tools.";

/// Settings for token-budgeted memory.
#[derive(Debug, Clone)]
pub struct WeightedMemory {
    /// Position weight is `decay^rank` (rank 0 = most recent turn)
    pub decay: f64,
    pub weights: SourceWeights,
    /// Token cap; the mesh's `memory_token_budget` when unset
    pub token_budget: Option<usize>,
    /// Turns loaded from history before weighting
    pub max_turns: usize,
}

impl Default for WeightedMemory {
    fn default() -> Self {
        Self {
            decay: 0.8,
            weights: SourceWeights::default(),
            token_budget: None,
            max_turns: 50,
        }
    }
}

/// How earlier turns are fed back to the model.
#[derive(Debug, Clone, Default)]
pub enum MemoryMode {
    /// Last `short_memory_size` question/answer pairs
    #[default]
    ShortTerm,
    /// Scored question/answer pairs and reasoning steps within a token budget
    Weighted(WeightedMemory),
}

/// Turns a raw model reply into a decision. Receives the agent's request.
pub type ReplyParser = Arc<dyn Fn(&str, &Request) -> ParsedReply + Send + Sync>;

/// Rewrites the request before the loop starts.
pub type InputHook = Arc<dyn Fn(Request) -> Result<Request, NodeError> + Send + Sync>;

/// Rewrites the finished response.
pub type OutputHook = Arc<dyn Fn(Response) -> Response + Send + Sync>;

/// Agent driving the ReAct loop over its permitted tools.
pub struct ReActAgent {
    config: NodeConfig,
    llm_name: String,
    max_rounds: Option<usize>,
    short_memory_size: Option<usize>,
    trust_mode: bool,
    memory_mode: MemoryMode,
    prompt: String,
    additional_prompt: String,
    llm_params: Option<Value>,
    parser: Option<ReplyParser>,
    process_input: Option<InputHook>,
    process_output: Option<OutputHook>,
}

impl ReActAgent {
    /// Create an agent that reasons with the model node `llm_name`.
    pub fn new(name: impl Into<String>, llm_name: impl Into<String>) -> Self {
        let llm_name = llm_name.into();
        Self {
            config: NodeConfig::new(name)
                .description("Answers questions by reasoning and calling tools")
                .permit([llm_name.clone()]),
            llm_name,
            max_rounds: None,
            short_memory_size: None,
            trust_mode: false,
            memory_mode: MemoryMode::default(),
            prompt: DEFAULT_PROMPT.to_string(),
            additional_prompt: String::new(),
            llm_params: None,
            parser: None,
            process_input: None,
            process_output: None,
        }
    }

    /// Tools (or tool collections, or other agents) this agent may call.
    pub fn tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.permit(names);
        self
    }

    pub fn with_config(mut self, f: impl FnOnce(NodeConfig) -> NodeConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub fn short_memory_size(mut self, turns: usize) -> Self {
        self.short_memory_size = Some(turns);
        self
    }

    /// Return tool observations as the answer without another reasoning round.
    pub fn trust_mode(mut self, enabled: bool) -> Self {
        self.trust_mode = enabled;
        self
    }

    pub fn memory_mode(mut self, mode: MemoryMode) -> Self {
        self.memory_mode = mode;
        self
    }

    /// Replace the system prompt template.
    ///
    /// `${tools_description}` and `${additional_prompt}` are substituted.
    pub fn prompt(mut self, template: impl Into<String>) -> Self {
        self.prompt = template.into();
        self
    }

    pub fn additional_prompt(mut self, text: impl Into<String>) -> Self {
        self.additional_prompt = text.into();
        self
    }

    pub fn llm_params(mut self, params: Value) -> Self {
        self.llm_params = Some(params);
        self
    }

    /// Replace the built-in reply parser (JSON tool calls, `<think>` prefix).
    pub fn parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&str, &Request) -> ParsedReply + Send + Sync + 'static,
    {
        self.parser = Some(Arc::new(parser));
        self
    }

    /// Rewrite each request after history is attached. An error rejects it.
    pub fn process_input<F>(mut self, hook: F) -> Self
    where
        F: Fn(Request) -> Result<Request, NodeError> + Send + Sync + 'static,
    {
        self.process_input = Some(Arc::new(hook));
        self
    }

    pub fn process_output<F>(mut self, hook: F) -> Self
    where
        F: Fn(Response) -> Response + Send + Sync + 'static,
    {
        self.process_output = Some(Arc::new(hook));
        self
    }

    fn parse(&self, reply: &str, request: &Request) -> ParsedReply {
        match &self.parser {
            Some(parser) => parser(reply, request),
            None => parse_reply(reply),
        }
    }

    fn history_limit(&self, mesh: &Mesh) -> usize {
        match &self.memory_mode {
            MemoryMode::ShortTerm => self
                .short_memory_size
                .unwrap_or(mesh.config().short_memory_size),
            MemoryMode::Weighted(weighted) => weighted.max_turns,
        }
    }

    fn describe_tools(&self, mesh: &Mesh) -> String {
        let Some(entry) = mesh.registry().get(self.name()) else {
            return String::new();
        };
        let mut names: Vec<&String> = entry
            .permitted()
            .iter()
            .filter(|name| **name != self.llm_name)
            .collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| mesh.node(name))
            .map(|node| {
                format!(
                    "Tool: {}\nDescription: {}\nArguments: {}",
                    node.name(),
                    node.description(),
                    node.parameters_schema()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn system_prompt(&self, mesh: &Mesh) -> String {
        self.prompt
            .replace("${tools_description}", &self.describe_tools(mesh))
            .replace("${additional_prompt}", &self.additional_prompt)
            .trim()
            .to_string()
    }

    /// Earlier turns rendered for the model, oldest first.
    fn history_messages(&self, turns: &[Turn], mesh: &Mesh) -> Vec<ChatMessage> {
        match &self.memory_mode {
            MemoryMode::ShortTerm => {
                let limit = self.history_limit(mesh);
                let skip = turns.len().saturating_sub(limit);
                let mut memory = Memory::new();
                memory.extend_turns(&turns[skip..]);
                memory.into_messages()
            }
            MemoryMode::Weighted(weighted) => {
                let budget = weighted
                    .token_budget
                    .unwrap_or(mesh.config().memory_token_budget);
                let entries = weigh_turns(turns, weighted.decay, weighted.weights);
                let total = entries.len();
                let retained = select_within_budget(entries, budget);
                tracing::debug!(
                    agent = %self.name(),
                    retained = retained.len(),
                    total,
                    budget,
                    "Weighted memory selected"
                );
                replay(retained)
            }
        }
    }

    async fn call_model(&self, request: &Request, mesh: &Mesh, messages: &[ChatMessage]) -> Response {
        mesh.call(
            request,
            &self.llm_name,
            llm_arguments(messages, self.llm_params.as_ref()),
        )
        .await
    }

    /// Dispatch one round of tool calls and merge the results.
    async fn act(&self, request: &Request, mesh: &Mesh, calls: &[ToolCall]) -> Vec<(String, Response)> {
        let dispatch = calls
            .iter()
            .map(|call| (call.tool_name.clone(), call.arguments.clone()))
            .collect();
        let responses = mesh.call_parallel(request, dispatch).await;

        let mut seen: HashMap<&str, usize> = HashMap::new();
        calls
            .iter()
            .zip(responses)
            .map(|(call, response)| {
                let count = seen.entry(call.tool_name.as_str()).or_insert(0);
                *count += 1;
                let key = if *count == 1 {
                    call.tool_name.clone()
                } else {
                    format!("{}#{}", call.tool_name, count)
                };
                (key, response)
            })
            .collect()
    }

    async fn fallback(
        &self,
        request: &Request,
        mesh: &Mesh,
        query: &str,
        observations: &[(String, String)],
        rounds: usize,
    ) -> Result<Output, NodeError> {
        tracing::warn!(
            agent = %self.name(),
            rounds,
            observations = observations.len(),
            "Round budget exhausted, synthesizing fallback answer"
        );

        let observation_text = observations
            .iter()
            .map(|(tool, text)| format!("[{}] {}", tool, text))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = vec![
            ChatMessage::system(FALLBACK_PROMPT),
            ChatMessage::user(format!(
                "Question: {}\n\nObservations:\n{}",
                query,
                if observation_text.is_empty() {
                    "(none)"
                } else {
                    observation_text.as_str()
                }
            )),
        ];

        let response = self.call_model(request, mesh, &messages).await;
        let synthesized = completed_text(&response)?
            .and_then(|text| match self.parse(&text, request).action {
                Action::Answer(answer) => Some(answer),
                _ => None,
            })
            .filter(|text| !text.trim().is_empty());

        let answer = match synthesized {
            Some(text) => text,
            None if !observations.is_empty() => format!(
                "I could not finish within the allowed steps. Results so far:\n{}",
                observation_text
            ),
            None => "Sorry, I could not find an answer within the allowed steps.".to_string(),
        };

        Ok(Output::new(answer).with_extra("fallback", true))
    }
}

/// Merged observation text: a single result verbatim, several keyed by tool.
fn merge_observations(results: &[(String, Response)]) -> String {
    match results {
        [(_, response)] => response.text(),
        _ => {
            let merged: serde_json::Map<String, Value> = results
                .iter()
                .map(|(key, response)| (key.clone(), Value::String(response.text())))
                .collect();
            Value::Object(merged).to_string()
        }
    }
}

#[async_trait]
impl Node for ReActAgent {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Agent
    }

    async fn pre_process(&self, request: Request, mesh: &Mesh) -> Result<Request, NodeError> {
        let limit = self.history_limit(mesh);
        let request = attach_history(request, mesh, limit).await;
        match &self.process_input {
            Some(hook) => hook(request),
            None => Ok(request),
        }
    }

    async fn post_process(&self, response: Response, _request: &Request, _mesh: &Mesh) -> Response {
        match &self.process_output {
            Some(hook) => hook(response),
            None => response,
        }
    }

    async fn execute(&self, request: &Request, mesh: &Mesh) -> Result<Output, NodeError> {
        let max_rounds = self.max_rounds.unwrap_or(mesh.config().max_react_rounds);
        let query = request.query();
        let system = self.system_prompt(mesh);
        let history = self.history_messages(&attached_history(request), mesh);

        let mut reasoning_memory: Vec<ChatMessage> = Vec::new();
        let mut observations: Vec<(String, String)> = Vec::new();
        let mut reasoning_trace: Vec<String> = Vec::new();

        for round in 0..max_rounds {
            tracing::debug!(agent = %self.name(), round = round + 1, max_rounds, "ReAct round");

            let mut memory = Memory::with_system(system.clone());
            memory.extend(history.iter().cloned());
            memory.push_user(query.clone());
            memory.extend(reasoning_memory.iter().cloned());

            let response = self.call_model(request, mesh, memory.messages()).await;
            let Some(reply) = completed_text(&response)? else {
                tracing::warn!(
                    agent = %self.name(),
                    state = ?response.state,
                    "Model call did not complete: {}",
                    response.text()
                );
                break;
            };

            let parsed = self.parse(&reply, request);
            if let Some(reasoning) = &parsed.reasoning {
                reasoning_trace.push(reasoning.clone());
                mesh.notify(Event::Reasoning {
                    trace_id: request.trace_id.clone(),
                    node_id: request.node_id().to_string(),
                    node: self.name().to_string(),
                    content: reasoning.clone(),
                })
                .await;
            }

            match parsed.action {
                Action::Answer(answer) if !answer.trim().is_empty() => {
                    let mut output = Output::new(answer)
                        .with_extra("react_memory", json!(reasoning_memory))
                        .with_extra("rounds", round + 1);
                    if !reasoning_trace.is_empty() {
                        output = output.with_extra("reasoning", reasoning_trace.join("\n\n"));
                    }
                    return Ok(output);
                }
                Action::Answer(_) => {
                    reasoning_memory.push(ChatMessage::assistant(parsed.decision));
                    reasoning_memory.push(ChatMessage::user(
                        "Your reply was empty. Answer the question or call a tool.",
                    ));
                }
                Action::Malformed { raw, reason } => {
                    tracing::debug!(agent = %self.name(), "Malformed tool call: {}", reason);
                    reasoning_memory.push(ChatMessage::assistant(raw));
                    reasoning_memory.push(ChatMessage::user(format!(
                        "Your tool call could not be parsed ({}). Regenerate it as valid JSON: \
                         {{\"tool_name\": \"<tool name>\", \"arguments\": {{...}}}}",
                        reason
                    )));
                }
                Action::ToolCalls(calls) => {
                    let trusted = self.trust_mode || calls.iter().any(|c| c.trust_mode);
                    let results = self.act(request, mesh, &calls).await;
                    let observation = merge_observations(&results);
                    observations.extend(
                        results
                            .iter()
                            .map(|(key, response)| (key.clone(), response.text())),
                    );

                    if trusted {
                        tracing::debug!(agent = %self.name(), "Trust mode: returning observation");
                        return Ok(Output::new(observation)
                            .with_extra("trust_mode", true)
                            .with_extra("rounds", round + 1));
                    }

                    reasoning_memory.push(ChatMessage::assistant(parsed.decision));
                    reasoning_memory.push(ChatMessage::user(format!("Observation: {}", observation)));
                }
            }
        }

        let mut output = self
            .fallback(request, mesh, &query, &observations, max_rounds)
            .await?;
        output = output.with_extra("react_memory", json!(reasoning_memory));
        if !reasoning_trace.is_empty() {
            output = output.with_extra("reasoning", reasoning_trace.join("\n\n"));
        }
        Ok(output)
    }
}
