//! OpenAI-compatible chat completions client.
//!
//! Retrying is left to the node lifecycle; this client makes exactly one HTTP
//! request per call and classifies failures as [`LlmError`].

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::error::LlmError;
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};

/// HTTP client for any endpoint speaking the chat completions protocol.
pub struct HttpLlmClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request(
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> CompletionRequest {
        CompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            stream,
            extra: options.extra.clone(),
        }
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network_error(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    LlmError::network_error(format!("Connection failed: {}", e))
                } else {
                    LlmError::network_error(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            Err(LlmError::rate_limited(body))
        } else {
            Err(LlmError::from_status(status.as_u16(), body))
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let request = Self::build_request(model, messages, options, false);
        tracing::debug!("Sending chat completion: model={}", model);

        let response = self.send(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read body: {}", e)))?;

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            reasoning: choice.message.reasoning_content.or(choice.message.reasoning),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or_else(|| Some(model.to_string())),
        })
    }

    async fn chat_completion_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        deltas: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<ChatResponse> {
        let request = Self::build_request(model, messages, options, true);
        tracing::debug!("Sending streaming chat completion: model={}", model);

        let response = self.send(&request).await?;
        let mut byte_stream = Box::pin(response.bytes_stream());
        let mut buffer: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut usage = None;
        let mut response_model = None;

        'stream: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk
                .map_err(|e| LlmError::network_error(format!("Stream interrupted: {}", e)))?;
            buffer.extend_from_slice(&chunk);

            // Chunks may end mid-character; only complete lines are decoded.
            while let Some(line) = take_line(&mut buffer) {
                let line = match std::str::from_utf8(&line) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::debug!("Skipping non-UTF-8 stream line: {}", e);
                        continue;
                    }
                };
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'stream;
                }
                let parsed: StreamChunk = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::debug!("Skipping unparseable stream chunk: {}", e);
                        continue;
                    }
                };
                if parsed.model.is_some() {
                    response_model = parsed.model;
                }
                if let Some(u) = parsed.usage {
                    usage = Some(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                }
                for choice in parsed.choices {
                    if let Some(r) = choice.delta.reasoning_content.or(choice.delta.reasoning) {
                        reasoning.push_str(&r);
                    }
                    if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                        content.push_str(&text);
                        // Receiver gone means nobody is listening; keep collecting.
                        let _ = deltas.send(text);
                    }
                }
            }
        }

        Ok(ChatResponse {
            content: Some(content),
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            usage,
            model: response_model.or_else(|| Some(model.to_string())),
        })
    }
}

/// Remove and return the first newline-terminated line in `buffer`.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let newline = buffer.iter().position(|b| *b == b'\n')?;
    Some(buffer.drain(..=newline).collect())
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}
