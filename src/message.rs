//! Conversation data model: [`Message`], tool call/result records, and the
//! per-session [`ChatHistory`].
//!
//! Messages are immutable once appended; histories enforce the invariant
//! that a tool-result item always answers a tool-call recorded earlier in
//! the same history.

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::utils::now_ms;

/// Maximum length of an author name (chat APIs reject longer names).
pub const MAX_AUTHOR_NAME_LEN: usize = 64;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A request to invoke a tool, as produced by the chat model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within the conversation.
    pub call_id: String,
    pub tool_name: String,
    /// Structured argument map.
    pub arguments: serde_json::Value,
}

/// Structured failure attached to a [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Short machine-readable kind (e.g. `"forbidden-tool"`).
    pub kind: String,
    pub message: String,
}

/// The outcome of a tool invocation, matched to its call by `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    /// Text or structured payload returned by the tool.
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Render the payload as display text for prompts and summaries.
    pub fn text(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Ordered record embedded in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum MessageItem {
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// A single conversational message. Immutable once appended to a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Optional author name, truncated to [`MAX_AUTHOR_NAME_LEN`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
    /// Tool-call / tool-result records carried by this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<MessageItem>,
    /// Unix-epoch timestamp in milliseconds.
    pub timestamp: u64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            name: None,
            content: content.into(),
            items: Vec::new(),
            timestamp: now_ms(),
        }
    }

    /// Construct with an author name, enforcing the length cap.
    pub fn named(role: Role, name: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(role, content);
        msg.name = Some(crate::utils::truncate_str(&name.into(), MAX_AUTHOR_NAME_LEN));
        msg
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_items(mut self, items: Vec<MessageItem>) -> Self {
        self.items = items;
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// Tool-call ids introduced by this message.
    pub fn tool_call_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(|it| match it {
            MessageItem::ToolCall(c) => Some(c.call_id.as_str()),
            MessageItem::ToolResult(_) => None,
        })
    }

    /// Tool-result ids answered by this message.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(|it| match it {
            MessageItem::ToolResult(r) => Some(r.call_id.as_str()),
            MessageItem::ToolCall(_) => None,
        })
    }
}

/// Ordered per-session message sequence.
///
/// Owned exclusively by the memory store; the engine works on cloned
/// snapshots for the duration of a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatHistory {
    messages: Vec<Message>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh history seeded with one system message.
    pub fn seeded(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn system_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_system()).count()
    }

    pub fn non_system_count(&self) -> usize {
        self.len() - self.system_count()
    }

    /// Append a message, validating that any tool-result items answer a
    /// tool-call already present in this history (or earlier in the same
    /// message's item list).
    pub fn push(&mut self, message: Message) -> anyhow::Result<()> {
        let mut known: std::collections::HashSet<&str> = self
            .messages
            .iter()
            .flat_map(|m| m.tool_call_ids())
            .collect();
        for item in &message.items {
            match item {
                MessageItem::ToolCall(c) => {
                    known.insert(c.call_id.as_str());
                }
                MessageItem::ToolResult(r) => {
                    if !known.contains(r.call_id.as_str()) {
                        bail!(
                            "tool result '{}' does not match any prior tool call",
                            r.call_id
                        );
                    }
                }
            }
        }
        self.messages.push(message);
        Ok(())
    }

    /// Remove the messages at `indices` (ascending, deduplicated by caller).
    pub fn remove_indices(&mut self, indices: &[usize]) {
        for &idx in indices.iter().rev() {
            if idx < self.messages.len() {
                self.messages.remove(idx);
            }
        }
    }

    /// Replace the content of the message at `index` with a truncated body.
    ///
    /// Used by token-driven truncation when even the preserved tail exceeds
    /// the target budget.
    pub fn truncate_body(&mut self, index: usize, keep_chars: usize) {
        if let Some(msg) = self.messages.get_mut(index) {
            if msg.content.len() > keep_chars {
                msg.content = crate::utils::truncate_str(&msg.content, keep_chars);
            }
        }
    }

    /// The last `n` messages, in order.
    pub fn tail(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }
}

impl From<Vec<Message>> for ChatHistory {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}
