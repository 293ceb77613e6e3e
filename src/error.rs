//! Error kinds shared across the orchestrator.
//!
//! Components use `anyhow` internally; at subsystem boundaries failures are
//! classified into an [`ErrorKind`] so the turn loop can decide whether to
//! recover, record, or surface them.

use thiserror::Error;

/// Classified failure carried across the turn boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Malformed request: empty query, missing user id, no coordinator.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// Tool not on the invoking agent's allowlist. Never retried.
    #[error("tool '{tool}' is not permitted for agent '{agent}'")]
    ForbiddenTool { agent: String, tool: String },

    /// Network/transport failure reaching a tool endpoint.
    #[error("tool transport failure: {0}")]
    ToolTransport(String),

    /// The tool itself returned a structured error.
    #[error("tool error: {0}")]
    ToolError(String),

    /// Transient chat-model failure (may succeed on retry).
    #[error("transient model failure: {0}")]
    ModelTransient(String),

    /// The chat model refused or hard-failed.
    #[error("model failure: {0}")]
    ModelFatal(String),

    /// A deadline elapsed at the bounding scope.
    #[error("deadline elapsed: {0}")]
    Timeout(String),

    /// The token budget cannot accommodate the request.
    #[error("token budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Persistence read/write failed; the turn continues without it.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// A named agent, session, or tool does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Cooperative cancellation observed.
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Stable short label used in tool results and activity events.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::InputInvalid(_) => "input-invalid",
            ErrorKind::ForbiddenTool { .. } => "forbidden-tool",
            ErrorKind::ToolTransport(_) => "tool-transport",
            ErrorKind::ToolError(_) => "tool-error",
            ErrorKind::ModelTransient(_) => "model-transient",
            ErrorKind::ModelFatal(_) => "model-fatal",
            ErrorKind::Timeout(_) => "timeout",
            ErrorKind::BudgetExceeded(_) => "budget-exceeded",
            ErrorKind::PersistenceUnavailable(_) => "persistence-unavailable",
            ErrorKind::NotFound(_) => "not-found",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether this kind is handled in-component rather than surfaced.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::PersistenceUnavailable(_)
                | ErrorKind::ModelTransient(_)
                | ErrorKind::ToolTransport(_)
                | ErrorKind::BudgetExceeded(_)
        )
    }

    /// User-facing description that does not leak internal identifiers.
    pub fn user_message(&self) -> String {
        match self {
            ErrorKind::InputInvalid(msg) => format!("Your request could not be processed: {msg}"),
            ErrorKind::ForbiddenTool { .. } => {
                "A requested operation is not permitted for this assistant.".to_string()
            }
            ErrorKind::Timeout(_) => {
                "The request took too long to complete. Please try again.".to_string()
            }
            ErrorKind::Cancelled => "The request was cancelled.".to_string(),
            _ => "I ran into a problem while answering. Please try rephrasing your question."
                .to_string(),
        }
    }
}
