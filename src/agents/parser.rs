//! Model output parsing for the ReAct loop.
//!
//! A reply is read as:
//! - text before the last `</think>` is auxiliary reasoning
//! - the first balanced JSON object carrying `tool_name` is a tool call, and
//!   an array of such objects is several calls in one round
//! - JSON-looking text mentioning `tool_name` and `arguments` that does not
//!   parse is malformed and triggers self-correction
//! - anything else is the answer

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// One requested tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    /// Return the observation as the final answer
    pub trust_mode: bool,
}

/// Decision extracted from a model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ToolCalls(Vec<ToolCall>),
    Answer(String),
    Malformed { raw: String, reason: String },
}

/// A parsed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    /// Text before the last `</think>`, tags removed
    pub reasoning: Option<String>,
    /// The decision part of the reply
    pub decision: String,
    pub action: Action,
}

fn strip_think_tags(text: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    match RE.get_or_init(|| Regex::new(r"(?i)<\s*/?\s*think\s*>").ok()) {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.replace("<think>", "").replace("</think>", ""),
    }
}

/// Split a reply into its reasoning prefix and decision text.
pub fn split_reasoning(raw: &str) -> (Option<String>, &str) {
    match raw.rfind("</think>") {
        Some(index) => {
            let reasoning = strip_think_tags(&raw[..index]).trim().to_string();
            let decision = raw[index + "</think>".len()..].trim();
            ((!reasoning.is_empty()).then_some(reasoning), decision)
        }
        None => (None, raw.trim()),
    }
}

/// Balanced JSON candidate starting at byte `start` (an opening bracket).
///
/// Returns the rest of the text when the brackets never balance.
fn balanced_from(text: &str, start: usize) -> &str {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[start..start + offset + ch.len_utf8()];
                }
            }
            _ => {}
        }
    }
    &text[start..]
}

/// Every balanced JSON candidate, in order of appearance.
fn json_candidates(text: &str) -> impl Iterator<Item = &str> {
    text.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .map(move |(i, _)| balanced_from(text, i))
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn tool_call_from(object: &Map<String, Value>) -> Result<ToolCall, String> {
    let tool_name = object
        .get("tool_name")
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| "tool_name must be a non-empty string".to_string())?;

    let arguments = match object.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => return Err("arguments must be a JSON object".to_string()),
        },
        Some(_) => return Err("arguments must be a JSON object".to_string()),
    };

    Ok(ToolCall {
        tool_name: tool_name.trim().to_string(),
        arguments,
        trust_mode: is_truthy(object.get("trust_mode")),
    })
}

/// Interpret a parsed value as tool calls, if it is a descriptor.
fn descriptor(value: &Value) -> Option<Result<Vec<ToolCall>, String>> {
    match value {
        Value::Object(object) if object.contains_key("tool_name") => {
            Some(tool_call_from(object).map(|call| vec![call]))
        }
        Value::Array(items)
            if !items.is_empty()
                && items
                    .iter()
                    .all(|i| i.as_object().is_some_and(|o| o.contains_key("tool_name"))) =>
        {
            Some(
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(tool_call_from)
                    .collect(),
            )
        }
        _ => None,
    }
}

fn looks_like_descriptor(text: &str) -> bool {
    ["tool_name", "arguments", "{", "}"]
        .iter()
        .all(|marker| text.contains(marker))
}

/// Parse one model reply.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let (reasoning, decision) = split_reasoning(raw);

    let mut action = None;
    for candidate in json_candidates(decision) {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        match descriptor(&value) {
            Some(Ok(calls)) => {
                action = Some(Action::ToolCalls(calls));
                break;
            }
            Some(Err(reason)) => {
                action = Some(Action::Malformed {
                    raw: decision.to_string(),
                    reason,
                });
                break;
            }
            None => {}
        }
    }

    let action = action.unwrap_or_else(|| {
        if looks_like_descriptor(decision) {
            Action::Malformed {
                raw: decision.to_string(),
                reason: "tool call is not valid JSON".to_string(),
            }
        } else {
            Action::Answer(decision.to_string())
        }
    });

    ParsedReply {
        reasoning,
        decision: decision.to_string(),
        action,
    }
}
