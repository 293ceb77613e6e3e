//! Session memory: per-session chat histories with token-aware truncation.
//!
//! The store exclusively owns every [`ChatHistory`]; the engine works on
//! cloned snapshots. Persistence failures are never fatal for a turn — a
//! failed read yields a fresh seeded history, a failed write is logged.

pub mod persist;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::message::{ChatHistory, Message};
use crate::tokens::{self, TokenBudget};

pub use persist::JsonlHistoryStore;

/// Extra messages allowed past `max_messages` before truncation triggers.
const SOFT_BUFFER: usize = 10;

/// Minimum non-system messages kept by count-based truncation.
const MIN_KEEP: usize = 5;

/// Messages included in a context summary.
const SUMMARY_WINDOW: usize = 10;

// ---------------------------------------------------------------------------
// Persistence collaborator
// ---------------------------------------------------------------------------

/// External history persistence. Read/write failures are non-fatal.
#[async_trait]
pub trait HistoryPersistence: Send + Sync {
    /// Returns the serialized history, or `None` when the session is new.
    async fn read(&self, session_id: &str, user_id: &str) -> anyhow::Result<Option<String>>;
    async fn write(
        &self,
        session_id: &str,
        user_id: &str,
        serialized: &str,
    ) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Token statistics
// ---------------------------------------------------------------------------

/// Token usage snapshot for one session.
#[derive(Debug, Clone, Copy)]
pub struct TokenStats {
    pub messages_tokens: usize,
    pub total_messages: usize,
    pub usage_percentage: usize,
    pub available_tokens: usize,
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Maps session ids to chat histories.
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<ChatHistory>>>>,
    persistence: Arc<dyn HistoryPersistence>,
    budget: TokenBudget,
    max_messages: usize,
    system_prompt: String,
}

impl MemoryStore {
    pub fn new(
        persistence: Arc<dyn HistoryPersistence>,
        budget: TokenBudget,
        max_messages: usize,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence,
            budget,
            max_messages,
            system_prompt: system_prompt.into(),
        }
    }

    /// Get or create the in-memory slot for a session.
    async fn slot(&self, session_id: &str) -> Arc<Mutex<ChatHistory>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(slot) = sessions.get(session_id) {
                return Arc::clone(slot);
            }
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ChatHistory::seeded(self.system_prompt.clone())))
        }))
    }

    /// Load a session from persistence, or seed a fresh history.
    ///
    /// A failed or malformed read is non-fatal: the session starts fresh.
    pub async fn load(&self, session_id: &str, user_id: &str) -> ChatHistory {
        {
            let sessions = self.sessions.read().await;
            if let Some(slot) = sessions.get(session_id) {
                return slot.lock().await.clone();
            }
        }

        let history = match self.persistence.read(session_id, user_id).await {
            Ok(Some(serialized)) => {
                let history = deserialize_history(&serialized);
                info!(
                    session = %session_id,
                    messages = history.len(),
                    "loaded session history"
                );
                history
            }
            Ok(None) => {
                debug!(session = %session_id, "no persisted history, seeding new session");
                ChatHistory::seeded(self.system_prompt.clone())
            }
            Err(e) => {
                warn!(session = %session_id, error = %e,
                    "history read failed, starting fresh session");
                ChatHistory::seeded(self.system_prompt.clone())
            }
        };

        let mut sessions = self.sessions.write().await;
        let slot = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(history)));
        let result = slot.lock().await.clone();
        result
    }

    /// Append a message, applying count- and token-driven truncation.
    pub async fn append(&self, session_id: &str, message: Message) -> anyhow::Result<()> {
        let slot = self.slot(session_id).await;
        let mut history = slot.lock().await;
        history.push(message)?;

        // Count-based soft buffer.
        if history.len() > self.max_messages + SOFT_BUFFER {
            truncate_by_count(&mut history, self.max_messages);
            debug!(
                session = %session_id,
                messages = history.len(),
                "history truncated by message count"
            );
        }

        // Token budget enforcement.
        let target = self.budget.available_for_history();
        let plan = tokens::plan_truncation(history.messages(), target);
        if !plan.is_empty() {
            apply_plan(&mut history, &plan);
            info!(
                session = %session_id,
                dropped = plan.drop_indices.len(),
                tokens = tokens::count_messages(history.messages()).padded(),
                "history truncated to token budget"
            );
        }
        Ok(())
    }

    /// Apply token-driven truncation if the session exceeds the budget.
    ///
    /// Returns `true` when truncation was performed.
    pub async fn optimize_for_tokens(&self, session_id: &str) -> bool {
        let slot = self.slot(session_id).await;
        let mut history = slot.lock().await;
        let target = self.budget.available_for_history();
        let current = tokens::count_messages(history.messages()).padded();
        if current < target {
            return false;
        }
        let plan = tokens::plan_truncation(history.messages(), target);
        if plan.is_empty() {
            return false;
        }
        let before = history.len();
        apply_plan(&mut history, &plan);
        info!(
            session = %session_id,
            before_messages = before,
            after_messages = history.len(),
            before_tokens = current,
            "optimized session history for token budget"
        );
        true
    }

    /// Compact digest of the last non-system messages, capped at `max_chars`.
    pub async fn summary(&self, session_id: &str, max_chars: usize) -> String {
        let slot = self.slot(session_id).await;
        let history = slot.lock().await;
        let recent: Vec<&Message> = history
            .iter()
            .filter(|m| !m.is_system())
            .rev()
            .take(SUMMARY_WINDOW)
            .collect();
        let mut lines: Vec<String> = recent
            .into_iter()
            .rev()
            .map(|m| {
                let who = m.name.as_deref().unwrap_or(m.role.as_str());
                format!("{}: {}", who, m.content.replace('\n', " "))
            })
            .collect();
        let mut digest = lines.join("\n");
        while digest.len() > max_chars && lines.len() > 1 {
            lines.remove(0);
            digest = lines.join("\n");
        }
        crate::utils::truncate_str(&digest, max_chars)
    }

    /// A snapshot of the session history, if the session is in memory.
    pub async fn history(&self, session_id: &str) -> Option<ChatHistory> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(slot) => Some(slot.lock().await.clone()),
            None => None,
        }
    }

    /// Persist the session. Write failures are logged, never fatal.
    pub async fn save(&self, session_id: &str, user_id: &str) {
        let serialized = {
            let slot = self.slot(session_id).await;
            let history = slot.lock().await;
            serialize_history(&history)
        };
        if let Err(e) = self
            .persistence
            .write(session_id, user_id, &serialized)
            .await
        {
            warn!(session = %session_id, error = %e, "history write failed, continuing");
        } else {
            debug!(session = %session_id, "session history persisted");
        }
    }

    /// Remove a session from memory and persistence tracking.
    pub async fn clear(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Token usage statistics for a session.
    pub async fn token_stats(&self, session_id: &str) -> TokenStats {
        let available = self.budget.available_for_history();
        let sessions = self.sessions.read().await;
        let Some(slot) = sessions.get(session_id) else {
            return TokenStats {
                messages_tokens: 0,
                total_messages: 0,
                usage_percentage: 0,
                available_tokens: available,
            };
        };
        let history = slot.lock().await;
        let tokens = tokens::count_messages(history.messages()).padded();
        TokenStats {
            messages_tokens: tokens,
            total_messages: history.len(),
            usage_percentage: tokens * 100 / available.max(1),
            available_tokens: available.saturating_sub(tokens),
        }
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }
}

/// Keep all system messages plus the most recent non-system messages,
/// bounded below by [`MIN_KEEP`].
fn truncate_by_count(history: &mut ChatHistory, max_messages: usize) {
    let system_count = history.system_count();
    let keep_non_system = max_messages.saturating_sub(system_count).max(MIN_KEEP);
    let non_system_total = history.non_system_count();
    if non_system_total <= keep_non_system {
        return;
    }
    let mut to_drop = non_system_total - keep_non_system;
    let mut drop_indices = Vec::with_capacity(to_drop);
    for (idx, msg) in history.messages().iter().enumerate() {
        if to_drop == 0 {
            break;
        }
        if !msg.is_system() {
            drop_indices.push(idx);
            to_drop -= 1;
        }
    }
    history.remove_indices(&drop_indices);
}

/// Apply a truncation plan. Body truncation first: its index refers to the
/// pre-removal message order.
fn apply_plan(history: &mut ChatHistory, plan: &tokens::TruncationPlan) {
    if let Some((idx, keep_chars)) = plan.truncate_body {
        history.truncate_body(idx, keep_chars);
    }
    history.remove_indices(&plan.drop_indices);
}

/// Serialize a history as JSONL, one message per line.
pub fn serialize_history(history: &ChatHistory) -> String {
    let mut out = String::new();
    for msg in history.iter() {
        if let Ok(line) = serde_json::to_string(msg) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

/// Parse a JSONL history, skipping malformed lines.
pub fn deserialize_history(serialized: &str) -> ChatHistory {
    let mut messages = Vec::new();
    for line in serialized.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(msg) => messages.push(msg),
            Err(e) => {
                debug!(error = %e, "skipping malformed history line");
            }
        }
    }
    ChatHistory::from(messages)
}
