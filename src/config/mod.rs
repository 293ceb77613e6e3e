//! Configuration loaded from `config.yaml`.
//!
//! Holds the chat-model and tool-endpoint collaborator settings, the agent
//! roster, and the recognized orchestrator options with their defaults.
//! Secret values support env-var references (`api_key: $OPENAI_API_KEY`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::tokens::TokenBudget;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Chat-model service settings.
    pub model: ModelConfig,
    /// Tool endpoint settings. Optional — agents without tools still answer
    /// from the chat model alone.
    #[serde(default)]
    pub tool_endpoint: Option<ToolEndpointConfig>,
    /// Agent roster registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    /// System prompt seeded into fresh session histories.
    #[serde(default)]
    pub system_prompt: Option<String>,

    // -- recognized orchestrator options -------------------------------
    /// Absolute model context window.
    #[serde(default = "default_model_context_tokens")]
    pub model_context_tokens: usize,
    /// Subtracted before computing the safe limit.
    #[serde(default = "default_safety_reserve_tokens")]
    pub safety_reserve_tokens: usize,
    /// max_tokens for synthesis / final answers.
    #[serde(default = "default_response_reserve_tokens")]
    pub response_reserve_tokens: usize,
    /// Fixed overhead per model call.
    #[serde(default = "default_prompt_overhead_tokens")]
    pub prompt_overhead_tokens: usize,
    /// Soft cap on per-session history length.
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    /// Per-turn group chat iteration cap.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Per-turn wall-clock deadline.
    #[serde(default = "default_turn_timeout_seconds")]
    pub turn_timeout_seconds: u64,
    /// Follow-up loop cap for dynamic re-routing.
    #[serde(default = "default_reroute_iterations")]
    pub reroute_iterations: usize,
    /// Router scoring cut-off.
    #[serde(default = "default_include_threshold")]
    pub include_threshold: f64,
    /// Per-sink activity event buffer.
    #[serde(default = "default_activity_buffer")]
    pub activity_buffer: usize,
    /// Single tool call deadline.
    #[serde(default = "default_tool_request_timeout_seconds")]
    pub tool_request_timeout_seconds: u64,
    /// Streaming tool read deadline.
    #[serde(default = "default_tool_stream_timeout_seconds")]
    pub tool_stream_timeout_seconds: u64,
}

fn default_model_context_tokens() -> usize {
    128_000
}
fn default_safety_reserve_tokens() -> usize {
    8_000
}
fn default_response_reserve_tokens() -> usize {
    1_500
}
fn default_prompt_overhead_tokens() -> usize {
    800
}
fn default_max_history_messages() -> usize {
    50
}
fn default_max_iterations() -> usize {
    10
}
fn default_turn_timeout_seconds() -> u64 {
    60
}
fn default_reroute_iterations() -> usize {
    3
}
fn default_include_threshold() -> f64 {
    2.0
}
fn default_activity_buffer() -> usize {
    256
}
fn default_tool_request_timeout_seconds() -> u64 {
    30
}
fn default_tool_stream_timeout_seconds() -> u64 {
    300
}

/// Chat-model service settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Chat completions URL.
    pub endpoint: String,
    /// Model name to request (e.g. "gpt-4o-mini").
    pub model: String,
    /// API key — plain text or env-var reference (`$OPENAI_API_KEY`).
    #[serde(default)]
    pub api_key: Option<String>,
}

impl ModelConfig {
    /// The API key with env-var references resolved.
    pub fn resolved_api_key(&self) -> String {
        self.api_key
            .as_deref()
            .map(expand_env)
            .unwrap_or_default()
    }
}

/// Tool endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolEndpointConfig {
    /// Base URL of the tool service (exposes `/tools` and `/invoke`).
    pub url: String,
    /// Endpoint API key — plain text or env-var reference.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-tool request timeout overrides, in seconds.
    #[serde(default)]
    pub tool_timeouts: HashMap<String, u64>,
}

impl ToolEndpointConfig {
    pub fn resolved_api_key(&self) -> String {
        self.api_key
            .as_deref()
            .map(expand_env)
            .unwrap_or_default()
    }

    /// Per-tool timeout overrides as durations.
    pub fn timeout_overrides(&self) -> HashMap<String, Duration> {
        self.tool_timeouts
            .iter()
            .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
            .collect()
    }
}

/// One agent roster entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentEntry {
    /// Stable agent identifier.
    pub id: String,
    /// Display name shown in conversation transcripts.
    pub name: String,
    /// One-paragraph domain description.
    pub description: String,
    /// Domain tags (e.g. "databases", "documents").
    #[serde(default)]
    pub domains: Vec<String>,
    /// Routing keywords. Lowercased at registration.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Illustrative example queries.
    #[serde(default)]
    pub examples: Vec<String>,
    /// Names of tools this agent may invoke.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Routing weight multiplier.
    #[serde(default = "default_routing_weight")]
    pub routing_weight: f64,
    /// Marks the coordinator agent. Exactly one entry should set this.
    #[serde(default)]
    pub coordinator: bool,
    /// Per-agent instructions (system prompt for the agent's model calls).
    #[serde(default)]
    pub instructions: Option<String>,
}

fn default_routing_weight() -> f64 {
    1.0
}

impl Config {
    /// Load and parse a YAML config file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config = serde_yaml_ng::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> anyhow::Result<()> {
        let coordinators = self.agents.iter().filter(|a| a.coordinator).count();
        if !self.agents.is_empty() && coordinators != 1 {
            anyhow::bail!(
                "exactly one agent must be marked coordinator (found {coordinators})"
            );
        }
        if self.safety_reserve_tokens + self.response_reserve_tokens + self.prompt_overhead_tokens
            >= self.model_context_tokens
        {
            anyhow::bail!("token reserves leave no room for history");
        }
        Ok(())
    }

    /// The token budget derived from the configured reserves.
    pub fn budget(&self) -> TokenBudget {
        TokenBudget {
            model_context: self.model_context_tokens,
            safety_reserve: self.safety_reserve_tokens,
            response_reserve: self.response_reserve_tokens,
            prompt_overhead: self.prompt_overhead_tokens,
        }
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_seconds)
    }

    pub fn tool_request_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_request_timeout_seconds)
    }

    pub fn tool_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_stream_timeout_seconds)
    }
}

/// Expand a `$VAR` env reference; other strings pass through unchanged.
fn expand_env(value: &str) -> String {
    match value.strip_prefix('$') {
        Some(var) => std::env::var(var).unwrap_or_default(),
        None => value.to_string(),
    }
}
