//! Token accounting: counting, budget math, and truncation planning.
//!
//! Counts use real BPE tokenisation via `tiktoken-rs` (o200k_base, the
//! GPT-4o family encoding). When the tokenizer cannot be loaded the
//! accountant falls back to a character heuristic (~3.5 chars/token) and
//! marks the count as estimated so callers can pad it.

use std::sync::OnceLock;

use tracing::warn;

use crate::message::Message;

/// Fixed per-message overhead a chat model charges for serialization.
pub const PER_MESSAGE_OVERHEAD: usize = 4;

/// Characters per token for the fallback heuristic.
const CHARS_PER_TOKEN: f64 = 3.5;

/// Safety multiplier applied to estimated counts (x1.15).
const ESTIMATE_PAD_NUM: usize = 115;
const ESTIMATE_PAD_DEN: usize = 100;

/// Number of most-recent non-system messages truncation always preserves.
pub const PRESERVE_RECENT: usize = 5;

/// Cached BPE tokenizer. `None` when loading failed (heuristic fallback).
fn bpe() -> Option<&'static tiktoken_rs::CoreBPE> {
    static BPE: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| match tiktoken_rs::o200k_base() {
        Ok(enc) => Some(enc),
        Err(e) => {
            warn!(error = %e, "failed to load o200k_base tokenizer, using character heuristic");
            None
        }
    })
    .as_ref()
}

/// A token count, flagged when derived from the character heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCount {
    pub tokens: usize,
    pub estimated: bool,
}

impl TokenCount {
    /// The count with the estimation safety multiplier applied.
    pub fn padded(&self) -> usize {
        if self.estimated {
            self.tokens * ESTIMATE_PAD_NUM / ESTIMATE_PAD_DEN
        } else {
            self.tokens
        }
    }
}

/// Usage classification relative to the history budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLevel {
    /// Below 70% of the budget.
    Ok,
    /// 70–90% of the budget.
    Warn,
    /// At or above 90% of the budget.
    Critical,
}

/// Token budget configuration for one model deployment.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    /// Absolute model context window.
    pub model_context: usize,
    /// Subtracted before computing the safe limit.
    pub safety_reserve: usize,
    /// Tokens reserved for the synthesized answer.
    pub response_reserve: usize,
    /// Fixed prompt overhead per model call.
    pub prompt_overhead: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            model_context: 128_000,
            safety_reserve: 8_000,
            response_reserve: 1_500,
            prompt_overhead: 800,
        }
    }
}

impl TokenBudget {
    /// `MODEL_CONTEXT - SAFETY_RESERVE`.
    pub fn safe_limit(&self) -> usize {
        self.model_context.saturating_sub(self.safety_reserve)
    }

    /// `SAFE_LIMIT - RESPONSE_RESERVE - PROMPT_OVERHEAD`.
    pub fn available_for_history(&self) -> usize {
        self.safe_limit()
            .saturating_sub(self.response_reserve)
            .saturating_sub(self.prompt_overhead)
    }

    /// Classify a token count against the history budget.
    pub fn classify(&self, tokens: usize) -> UsageLevel {
        let budget = self.available_for_history().max(1);
        let pct = tokens * 100 / budget;
        if pct >= 90 {
            UsageLevel::Critical
        } else if pct >= 70 {
            UsageLevel::Warn
        } else {
            UsageLevel::Ok
        }
    }
}

/// Count tokens in a single string.
pub fn count(text: &str) -> TokenCount {
    match bpe() {
        Some(enc) => TokenCount {
            tokens: enc.encode_with_special_tokens(text).len(),
            estimated: false,
        },
        None => TokenCount {
            tokens: (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as usize,
            estimated: true,
        },
    }
}

/// Count one message: content + role + author name + fixed overhead.
pub fn count_message(message: &Message) -> TokenCount {
    let mut total = count(&message.content);
    let role = count(message.role.as_str());
    total.tokens += role.tokens;
    total.estimated |= role.estimated;
    if let Some(ref name) = message.name {
        let n = count(name);
        total.tokens += n.tokens;
        total.estimated |= n.estimated;
    }
    total.tokens += PER_MESSAGE_OVERHEAD;
    total
}

/// Total tokens for a slice of messages.
pub fn count_messages(messages: &[Message]) -> TokenCount {
    let mut total = TokenCount {
        tokens: 0,
        estimated: false,
    };
    for msg in messages {
        let c = count_message(msg);
        total.tokens += c.tokens;
        total.estimated |= c.estimated;
    }
    total
}

/// The result of [`plan_truncation`]: indices to drop, plus an optional
/// body truncation when dropping alone cannot reach the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruncationPlan {
    /// Message indices to remove, ascending (oldest non-system first).
    pub drop_indices: Vec<usize>,
    /// `(index, keep_chars)`: truncate the body of the message at `index`.
    pub truncate_body: Option<(usize, usize)>,
}

impl TruncationPlan {
    pub fn is_empty(&self) -> bool {
        self.drop_indices.is_empty() && self.truncate_body.is_none()
    }
}

/// Plan a truncation of `messages` down to `target_tokens`.
///
/// Drops oldest non-system messages first. System messages are never
/// dropped, and the most recent [`PRESERVE_RECENT`] non-system messages are
/// preserved; if even those exceed the target, the plan instead truncates
/// the body of the earliest preserved message.
pub fn plan_truncation(messages: &[Message], target_tokens: usize) -> TruncationPlan {
    let costs: Vec<usize> = messages.iter().map(|m| count_message(m).padded()).collect();
    let mut total: usize = costs.iter().sum();
    if total < target_tokens {
        return TruncationPlan::default();
    }

    let non_system: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.is_system())
        .map(|(i, _)| i)
        .collect();

    // Everything but the preserved tail is droppable, oldest first.
    let droppable = non_system.len().saturating_sub(PRESERVE_RECENT);
    let mut plan = TruncationPlan::default();
    for &idx in non_system.iter().take(droppable) {
        if total < target_tokens {
            break;
        }
        total -= costs[idx];
        plan.drop_indices.push(idx);
    }

    if total >= target_tokens {
        // Still over budget with only system messages and the preserved
        // tail left: truncate the body of the earliest preserved message.
        if let Some(&idx) = non_system.get(droppable) {
            let others = total - costs[idx];
            let keep_tokens = target_tokens
                .saturating_sub(others)
                .saturating_sub(PER_MESSAGE_OVERHEAD);
            let keep_chars = (keep_tokens as f64 * CHARS_PER_TOKEN) as usize;
            plan.truncate_body = Some((idx, keep_chars));
        }
    }

    plan
}
