//! HTTP tool endpoint transport.
//!
//! Talks to a tool service exposing two routes:
//!   - `GET  /tools`  → JSON array of tool specs
//!   - `POST /invoke` → `{ "tool": name, "arguments": {...} }`
//!
//! Per-request identity travels out-of-band as headers: `x-user-id`,
//! `x-session-id`, and `authorization: Bearer <token>` for downstream
//! credentials.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{InvocationContext, ToolSpec, ToolTransport, TransportError};

/// Header carrying the requesting user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the session id.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Stateless HTTP transport for a single tool service.
pub struct HttpToolEndpoint {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpToolEndpoint {
    /// `stream_timeout` bounds reads of long-running responses and is baked
    /// into the underlying client; per-call request deadlines are passed to
    /// [`ToolTransport::call`].
    pub fn new(base_url: String, api_key: String, stream_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::builder()
                .read_timeout(stream_timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn apply_headers(
        &self,
        req: reqwest::RequestBuilder,
        context: &InvocationContext,
    ) -> reqwest::RequestBuilder {
        let mut req = req
            .header(USER_ID_HEADER, &context.user_id)
            .header(SESSION_ID_HEADER, &context.session_id);
        if let Some(ref token) = context.access_token {
            req = req.bearer_auth(token);
        } else if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        req
    }
}

#[async_trait]
impl ToolTransport for HttpToolEndpoint {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        let url = format!("{}/tools", self.base_url);
        let mut req = self.client.get(&url);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("list tools from {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("tool endpoint returned {status} for {url}");
        }
        let specs: Vec<ToolSpec> = resp.json().await.context("parse tool catalogue")?;
        Ok(specs)
    }

    async fn call(
        &self,
        tool_name: &str,
        arguments: &Value,
        context: &InvocationContext,
        deadline: Duration,
    ) -> Result<Value, TransportError> {
        let url = format!("{}/invoke", self.base_url);
        let body = json!({ "tool": tool_name, "arguments": arguments });

        let req = self
            .apply_headers(self.client.post(&url), context)
            .timeout(deadline)
            .json(&body);

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(TransportError::Timeout),
            Err(e) => return Err(TransportError::Transport(format!("{url}: {e}"))),
        };

        let status = resp.status();
        let parsed: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                return Err(TransportError::Transport(format!(
                    "unreadable response from {url}: {e}"
                )))
            }
        };

        // Tool-level errors ride in the body, with or without an HTTP error
        // status.
        if let Some(error) = parsed.get("error") {
            let (kind, message) = match error {
                Value::Object(obj) => (
                    obj.get("kind")
                        .and_then(|k| k.as_str())
                        .unwrap_or("tool-error")
                        .to_string(),
                    obj.get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("tool returned an error")
                        .to_string(),
                ),
                other => ("tool-error".to_string(), other.to_string()),
            };
            return Err(TransportError::Tool { kind, message });
        }

        if !status.is_success() {
            return Err(TransportError::Transport(format!(
                "tool endpoint returned {status}"
            )));
        }

        Ok(parsed.get("result").cloned().unwrap_or(parsed))
    }
}
