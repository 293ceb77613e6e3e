//! OpenAI-compatible chat completions client.
//!
//! Works with any API implementing the OpenAI chat completions interface:
//! OpenRouter, Ollama, Groq, vLLM, Azure-style gateways, etc.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{serialize_messages, ChatModel, GenerateOptions, ModelError, ModelReply};
use crate::message::{Message, ToolCall};

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAICompatModel {
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAICompatModel {
    /// Create a client. `api_key` may be empty for local servers.
    pub fn new(endpoint: String, api_key: String, model: String) -> Self {
        Self {
            endpoint,
            api_key,
            model,
            client: Client::builder()
                .timeout(Duration::from_secs(90))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

/// Parse `tool_calls` from a chat completion response, if present.
fn parse_tool_calls(body: &serde_json::Value) -> Option<Vec<ToolCall>> {
    let tool_calls = body
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("tool_calls")?
        .as_array()?;
    let calls: Vec<ToolCall> = tool_calls
        .iter()
        .filter_map(|tc| {
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let raw_args = func.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
            let arguments =
                serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));
            let call_id = tc
                .get("id")
                .and_then(|i| i.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .unwrap_or_else(|| format!("call_{}", crate::utils::generate_nonce()));
            Some(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            })
        })
        .collect();
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Map an HTTP status + body into a classified [`ModelError`].
fn classify_status(status: reqwest::StatusCode, retry_after: Option<Duration>, body: String) -> ModelError {
    if status.as_u16() == 429 {
        ModelError::RateLimited {
            retry_after,
            message: format!("chat API returned 429: {body}"),
        }
    } else if status.is_server_error() {
        ModelError::Transient(format!("chat API returned {status}: {body}"))
    } else {
        ModelError::Fatal(format!("chat API returned {status}: {body}"))
    }
}

#[async_trait]
impl ChatModel for OpenAICompatModel {
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ModelReply, ModelError> {
        let mut body = json!({
            "model": self.model,
            "messages": serialize_messages(messages),
            "temperature": options.temperature,
        });
        if options.max_tokens > 0 {
            body["max_tokens"] = json!(options.max_tokens);
        }
        if !options.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(
                options
                    .tools
                    .iter()
                    .map(|t| json!({ "type": "function", "function": t }))
                    .collect(),
            );
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ModelError::Transient(format!("chat API request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, text));
        }

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ModelError::Transient(format!("chat API body unreadable: {e}")))?;

        if let Some(calls) = parse_tool_calls(&parsed) {
            return Ok(ModelReply::ToolCalls(calls));
        }

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        Ok(ModelReply::Final(content))
    }
}
