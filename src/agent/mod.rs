//! Agent runtime: the [`Agent`] capability trait and the chat-model-backed
//! [`ModelAgent`] implementation.
//!
//! Agents are values owned by the orchestrator; they hold their own id and
//! instructions but reach every shared collaborator (chat model, tool
//! mediator) through injected handles. Cross-agent messaging is always
//! mediated by the engine — agents never reference each other.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::message::{Message, MessageItem, Role};
use crate::models::{GenerateOptions, ModelClient, ModelReply};
use crate::tools::{InvocationContext, ToolMediator, ToolSpec};

/// Maximum tool-invocation round-trips within one agent answer.
const MAX_TOOL_ITERATIONS: usize = 3;

/// Capability set every conversation participant implements.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable agent id (matches the registry descriptor).
    fn id(&self) -> &str;

    /// Display name used to tag conversation messages.
    fn name(&self) -> &str;

    /// Produce one reply given the conversation so far.
    async fn answer(
        &self,
        history: &[Message],
        context: &InvocationContext,
        cancel: &CancellationToken,
    ) -> Result<Message, ErrorKind>;

    /// The tools this agent can invoke.
    async fn list_tools(&self) -> Vec<ToolSpec>;

    /// Whether this agent may invoke the named tool.
    async fn can_handle(&self, tool_name: &str) -> bool;
}

/// An agent backed by the chat model, optionally with mediated tools.
pub struct ModelAgent {
    id: String,
    name: String,
    /// Per-agent system instructions.
    instructions: String,
    model: ModelClient,
    mediator: Option<Arc<ToolMediator>>,
    temperature: f32,
    max_tokens: usize,
}

impl ModelAgent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instructions: impl Into<String>,
        model: ModelClient,
        mediator: Option<Arc<ToolMediator>>,
        max_tokens: usize,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            instructions: instructions.into(),
            model,
            mediator,
            temperature: 0.1,
            max_tokens,
        }
    }

    /// Build the message list for a model call: instructions first, then
    /// the shared conversation.
    fn build_messages(&self, history: &[Message]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !self.instructions.is_empty() {
            messages.push(Message::system(self.instructions.clone()));
        }
        messages.extend_from_slice(history);
        messages
    }
}

#[async_trait]
impl Agent for ModelAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn answer(
        &self,
        history: &[Message],
        context: &InvocationContext,
        cancel: &CancellationToken,
    ) -> Result<Message, ErrorKind> {
        let mut messages = self.build_messages(history);

        let function_defs: Vec<serde_json::Value> = match self.mediator {
            Some(ref mediator) => match mediator.tools_for(&self.id).await {
                Ok(specs) => specs.iter().map(|s| s.function_def()).collect(),
                Err(e) => {
                    warn!(agent = %self.id, error = %e,
                        "tool discovery failed, answering without tools");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let options = GenerateOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: function_defs,
        };

        let mut reply = self.model.generate(&messages, &options, cancel).await?;

        // Tool-invocation loop: execute requested calls, feed results back,
        // and re-query until the model produces text or the cap is hit.
        for _iter in 0..MAX_TOOL_ITERATIONS {
            let calls = match reply {
                ModelReply::Final(text) => {
                    return Ok(Message::named(Role::Assistant, &self.name, text));
                }
                ModelReply::ToolCalls(calls) => calls,
            };
            let Some(ref mediator) = self.mediator else {
                warn!(agent = %self.id, "model requested tools but agent has no mediator");
                return Ok(Message::named(
                    Role::Assistant,
                    &self.name,
                    "I could not complete the requested operation.",
                ));
            };

            let call_items: Vec<MessageItem> = calls
                .iter()
                .cloned()
                .map(MessageItem::ToolCall)
                .collect();
            messages.push(Message::named(Role::Assistant, &self.name, "").with_items(call_items));

            let mut result_items = Vec::with_capacity(calls.len());
            for call in &calls {
                debug!(agent = %self.id, tool = %call.tool_name, "invoking tool");
                let result = mediator.invoke(&self.id, call, context, cancel).await;
                if cancel.is_cancelled() {
                    return Err(ErrorKind::Cancelled);
                }
                result_items.push(MessageItem::ToolResult(result));
            }
            messages.push(Message::new(Role::Tool, "").with_items(result_items));

            reply = self.model.generate(&messages, &options, cancel).await?;
        }

        match reply {
            ModelReply::Final(text) => Ok(Message::named(Role::Assistant, &self.name, text)),
            ModelReply::ToolCalls(calls) => {
                let names: Vec<&str> = calls.iter().map(|c| c.tool_name.as_str()).collect();
                warn!(agent = %self.id, tools = ?names, "tool loop exhausted");
                Ok(Message::named(
                    Role::Assistant,
                    &self.name,
                    format!("[tool loop exhausted] last requested: {}", names.join(", ")),
                ))
            }
        }
    }

    async fn list_tools(&self) -> Vec<ToolSpec> {
        match self.mediator {
            Some(ref mediator) => mediator.tools_for(&self.id).await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn can_handle(&self, tool_name: &str) -> bool {
        self.list_tools().await.iter().any(|t| t.name == tool_name)
    }
}
