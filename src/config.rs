//! Configuration management for agent-mesh.
//!
//! Configuration is read once from environment variables:
//! - `LLM_API_KEY` - Required by the binary. API key for the model endpoint.
//! - `LLM_BASE_URL` - Optional. OpenAI-compatible base URL. Defaults to `https://openrouter.ai/api/v1`.
//! - `DEFAULT_MODEL` - Optional. Model identifier. Defaults to `openai/gpt-4o-mini`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8081`.
//! - `NODE_TIMEOUT_SECS` - Optional. Per-attempt node timeout. Defaults to `300`.
//! - `NODE_RETRIES` - Optional. Extra attempts per invocation. Defaults to `2`.
//! - `NODE_RETRY_DELAY_MS` - Optional. Delay between attempts. Defaults to `1000`.
//! - `NODE_CONCURRENCY` - Optional. Concurrent work operations per node. Defaults to `16`.
//! - `MAX_REACT_ROUNDS` - Optional. Reasoning rounds before fallback. Defaults to `16`.
//! - `SHORT_MEMORY_SIZE` - Optional. History turns fed to agents. Defaults to `10`.
//! - `MAX_CALL_DEPTH` - Optional. Longest allowed call stack. Defaults to `32`.
//! - `MEMORY_TOKEN_BUDGET` - Optional. Token cap for weighted memory. Defaults to `4000`.
//! - `SEND_TIMEOUT_MS` - Optional. Bound on each outbound notification. Defaults to `500`.
//! - `TRACE_CAPACITY` - Optional. Chats remembered for continuation. Defaults to `10000`.
//! - `MCP_ENDPOINT` - Optional. HTTP endpoint of a tool server whose tools the binary registers.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Defaults applied to node configurations built by the binary.
#[derive(Debug, Clone)]
pub struct NodeDefaults {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub concurrency_limit: usize,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retries: 2,
            retry_delay: Duration::from_millis(1000),
            concurrency_limit: 16,
        }
    }
}

/// Mesh configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the model endpoint
    pub api_key: Option<String>,

    /// OpenAI-compatible base URL
    pub base_url: String,

    /// Default model identifier
    pub default_model: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Node lifecycle defaults
    pub node: NodeDefaults,

    /// Reasoning rounds before the ReAct fallback
    pub max_react_rounds: usize,

    /// History turns fed to agents
    pub short_memory_size: usize,

    /// Longest allowed call stack
    pub max_call_depth: usize,

    /// Token cap for weighted memory
    pub memory_token_budget: usize,

    /// Bound on each outbound notification
    pub send_timeout: Duration,

    /// Most recent chats kept for `from_trace_id` lineage; older ones are evicted
    pub trace_capacity: usize,

    /// Tool server registered by the binary
    pub mcp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            default_model: "openai/gpt-4o-mini".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8081,
            node: NodeDefaults::default(),
            max_react_rounds: 16,
            short_memory_size: 10,
            max_call_depth: 32,
            memory_token_budget: 4000,
            send_timeout: Duration::from_millis(500),
            trace_capacity: 10_000,
            mcp_endpoint: None,
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_key = std::env::var("LLM_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let base_url = std::env::var("LLM_BASE_URL").unwrap_or(defaults.base_url);
        let default_model = std::env::var("DEFAULT_MODEL").unwrap_or(defaults.default_model);
        let host = std::env::var("HOST").unwrap_or(defaults.host);
        let port = parse_env("PORT", defaults.port)?;

        let node = NodeDefaults {
            timeout: Duration::from_secs(parse_env(
                "NODE_TIMEOUT_SECS",
                defaults.node.timeout.as_secs(),
            )?),
            retries: parse_env("NODE_RETRIES", defaults.node.retries)?,
            retry_delay: Duration::from_millis(parse_env(
                "NODE_RETRY_DELAY_MS",
                defaults.node.retry_delay.as_millis() as u64,
            )?),
            concurrency_limit: parse_env("NODE_CONCURRENCY", defaults.node.concurrency_limit)?,
        };

        if node.concurrency_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "NODE_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            base_url,
            default_model,
            host,
            port,
            node,
            max_react_rounds: parse_env("MAX_REACT_ROUNDS", defaults.max_react_rounds)?,
            short_memory_size: parse_env("SHORT_MEMORY_SIZE", defaults.short_memory_size)?,
            max_call_depth: parse_env("MAX_CALL_DEPTH", defaults.max_call_depth)?,
            memory_token_budget: parse_env("MEMORY_TOKEN_BUDGET", defaults.memory_token_budget)?,
            send_timeout: Duration::from_millis(parse_env(
                "SEND_TIMEOUT_MS",
                defaults.send_timeout.as_millis() as u64,
            )?),
            trace_capacity: parse_env("TRACE_CAPACITY", defaults.trace_capacity)?.max(1),
            mcp_endpoint: std::env::var("MCP_ENDPOINT")
                .ok()
                .filter(|e| !e.trim().is_empty()),
        })
    }

    /// API key, required by the HTTP model client.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("LLM_API_KEY".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.node.retries, 2);
        assert_eq!(config.max_call_depth, 32);
        assert!(config.require_api_key().is_err());
    }

    #[test]
    fn test_parse_env_invalid_value() {
        std::env::set_var("AGENT_MESH_TEST_BAD_PORT", "eighty");
        let result: Result<u16, _> = parse_env("AGENT_MESH_TEST_BAD_PORT", 1);
        std::env::remove_var("AGENT_MESH_TEST_BAD_PORT");
        assert!(matches!(result, Err(ConfigError::InvalidValue(name, _)) if name == "AGENT_MESH_TEST_BAD_PORT"));
    }

    #[test]
    fn test_parse_env_missing_uses_default() {
        let result: usize = parse_env("AGENT_MESH_TEST_UNSET_VAR", 7).unwrap();
        assert_eq!(result, 7);
    }
}
