//! Chat-model collaborator: the [`ChatModel`] trait, shared wire helpers,
//! and [`ModelClient`] which adds retry/backoff and cancellation on top of
//! a concrete implementation.

pub mod openai_compat;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::message::{Message, MessageItem, Role, ToolCall};

pub use openai_compat::OpenAICompatModel;

// ---------------------------------------------------------------------------
// Options and replies
// ---------------------------------------------------------------------------

/// Options for a single generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: usize,
    /// Function definitions enabling tool-calling mode; empty disables it.
    pub tools: Vec<serde_json::Value>,
}

impl GenerateOptions {
    pub fn plain(temperature: f32, max_tokens: usize) -> Self {
        Self {
            temperature,
            max_tokens,
            tools: Vec::new(),
        }
    }
}

/// The model's reply: final text, or a request to invoke tools.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Final(String),
    ToolCalls(Vec<ToolCall>),
}

/// Failure from a concrete model implementation, classified for retry.
#[derive(Debug, Error)]
pub enum ModelError {
    /// May succeed on retry (5xx, connect failures, truncated bodies).
    #[error("transient: {0}")]
    Transient(String),
    /// Rate limited; `retry_after` honored when provided.
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// Hard failure (4xx, refusal, malformed request).
    #[error("fatal: {0}")]
    Fatal(String),
}

// ---------------------------------------------------------------------------
// ChatModel trait
// ---------------------------------------------------------------------------

/// Trait implemented by every chat completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate one assistant reply for the given conversation.
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ModelReply, ModelError>;
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Serialise messages into the OpenAI-compatible JSON array format.
///
/// Assistant messages carrying tool-call items get a `tool_calls` array;
/// each tool-result item becomes its own `role: "tool"` entry with the
/// matching `tool_call_id`.
pub fn serialize_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        let calls: Vec<&ToolCall> = msg
            .items
            .iter()
            .filter_map(|it| match it {
                MessageItem::ToolCall(c) => Some(c),
                MessageItem::ToolResult(_) => None,
            })
            .collect();

        let mut entry = serde_json::json!({ "role": msg.role.as_str() });
        if let Some(ref name) = msg.name {
            entry["name"] = serde_json::json!(name);
        }
        if calls.is_empty() {
            entry["content"] = serde_json::json!(msg.content);
        } else {
            // OpenAI expects null content on assistant tool-call messages.
            entry["content"] = if msg.content.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(msg.content)
            };
            entry["tool_calls"] = serde_json::Value::Array(
                calls
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.call_id,
                            "type": "function",
                            "function": {
                                "name": c.tool_name,
                                "arguments": c.arguments.to_string(),
                            }
                        })
                    })
                    .collect(),
            );
        }
        if msg.role == Role::Tool {
            // A tool message per result, keyed by tool_call_id.
            for item in &msg.items {
                if let MessageItem::ToolResult(r) = item {
                    out.push(serde_json::json!({
                        "role": "tool",
                        "tool_call_id": r.call_id,
                        "content": r.text(),
                    }));
                }
            }
            continue;
        }
        out.push(entry);
    }
    out
}

// ---------------------------------------------------------------------------
// ModelClient — retry / cancellation wrapper
// ---------------------------------------------------------------------------

/// Retries transient failures with exponential backoff.
const MAX_RETRIES: usize = 2;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Wraps a [`ChatModel`] with retry, backoff, and cooperative cancellation.
#[derive(Clone)]
pub struct ModelClient {
    inner: Arc<dyn ChatModel>,
}

impl ModelClient {
    pub fn new(inner: Arc<dyn ChatModel>) -> Self {
        Self { inner }
    }

    /// Generate with up to [`MAX_RETRIES`] retries on transient failures.
    ///
    /// Rate limits honor the provided retry-after hint. Fatal failures and
    /// cancellation surface immediately.
    pub async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelReply, ErrorKind> {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(ErrorKind::Cancelled);
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
                r = self.inner.generate(messages, options) => r,
            };
            match result {
                Ok(reply) => return Ok(reply),
                Err(ModelError::Fatal(msg)) => return Err(ErrorKind::ModelFatal(msg)),
                Err(ModelError::Transient(msg)) => {
                    if attempt >= MAX_RETRIES {
                        return Err(ErrorKind::ModelTransient(msg));
                    }
                    let delay = backoff_with_jitter(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %msg,
                        "transient model failure, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(ModelError::RateLimited {
                    retry_after,
                    message,
                }) => {
                    if attempt >= MAX_RETRIES {
                        return Err(ErrorKind::ModelTransient(message));
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff_with_jitter(attempt));
                    warn!(delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Convenience for callers that only want final text.
    pub async fn generate_text(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<String, ErrorKind> {
        match self.generate(messages, options, cancel).await? {
            ModelReply::Final(text) => Ok(text),
            ModelReply::ToolCalls(calls) => {
                let names: Vec<&str> = calls.iter().map(|c| c.tool_name.as_str()).collect();
                Err(ErrorKind::ModelFatal(format!(
                    "expected text but model requested tools: {}",
                    names.join(", ")
                )))
            }
        }
    }
}

/// Exponential backoff with a small deterministic-per-process jitter.
fn backoff_with_jitter(attempt: usize) -> Duration {
    let base = BACKOFF_BASE * 2u32.pow(attempt.min(4) as u32);
    let jitter_ms = crate::utils::now_ms() % 100;
    base + Duration::from_millis(jitter_ms)
}
