//! Router: picks the minimal participant set for a user message.
//!
//! Selection is deterministic — registry keyword/domain scores against a
//! threshold, a forced documents specialist for contextual references, and
//! an include-all fallback for substantial unmatched queries. The
//! coordinator's chat model contributes a natural-language routing strategy
//! that augments downstream selection but never replaces the deterministic
//! choice.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::message::Message;
use crate::models::{GenerateOptions, ModelClient};
use crate::registry::RegistrySnapshot;
use crate::utils::word_count;

/// Domain tag identifying the documents specialist.
pub const DOCUMENTS_DOMAIN: &str = "documents";

/// Phrases indicating the user refers to a document contextually.
const CONTEXTUAL_PHRASES: &[&str] = &[
    "that document",
    "the document",
    "the file",
    "this file",
    "analyze it",
    "summarize it",
    "uploaded",
];

/// File extensions treated as explicit filename mentions.
const FILE_EXTENSIONS: &[&str] = &[".txt", ".csv", ".pdf", ".md", ".docx", ".xlsx", ".json"];

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Minimum match score for a specialist to be included.
    pub include_threshold: f64,
    /// Word count above which an unmatched query includes all specialists.
    pub general_query_len: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            include_threshold: 2.0,
            general_query_len: 4,
        }
    }
}

/// The router's output for one turn.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Agent ids; the coordinator is always at position 0.
    pub participants: Vec<String>,
    /// Coordinator-produced routing guidance, when available.
    pub strategy: Option<String>,
    /// The message contains a contextual document reference.
    pub contextual_reference: bool,
}

impl Selection {
    /// True when only the coordinator was selected.
    pub fn is_coordinator_only(&self) -> bool {
        self.participants.len() == 1
    }
}

/// Detects a contextual document reference with no explicit filename.
pub fn has_contextual_reference(message: &str) -> bool {
    let lower = message.to_lowercase();
    let phrase_hit = CONTEXTUAL_PHRASES.iter().any(|p| lower.contains(p));
    phrase_hit && !mentions_filename(&lower)
}

fn mentions_filename(lower: &str) -> bool {
    FILE_EXTENSIONS.iter().any(|ext| lower.contains(ext))
}

/// Participant selector.
pub struct Router {
    model: ModelClient,
    config: RouterConfig,
}

impl Router {
    pub fn new(model: ModelClient, config: RouterConfig) -> Self {
        Self { model, config }
    }

    /// Select participants for a message against a registry snapshot.
    ///
    /// The routing strategy is computed before any fast-path decision so
    /// contextual document questions can still be routed when the initial
    /// participant set is a singleton.
    pub async fn select(
        &self,
        message: &str,
        history_digest: &str,
        snapshot: &RegistrySnapshot,
        cancel: &CancellationToken,
    ) -> Result<Selection, ErrorKind> {
        let coordinator = snapshot
            .coordinator()
            .ok_or_else(|| ErrorKind::InputInvalid("no coordinator registered".into()))?;

        let (specialists, contextual_reference) = self.deterministic_select(message, snapshot);

        let mut participants = Vec::with_capacity(specialists.len() + 1);
        participants.push(coordinator.agent_id.clone());
        participants.extend(specialists);

        info!(
            participants = ?participants,
            contextual_reference,
            "participants selected"
        );

        let strategy = self
            .routing_strategy(message, history_digest, snapshot, &participants, cancel)
            .await;

        Ok(Selection {
            participants,
            strategy,
            contextual_reference,
        })
    }

    /// The deterministic part of selection. Pure with respect to the
    /// snapshot: identical inputs yield identical participant lists.
    fn deterministic_select(
        &self,
        message: &str,
        snapshot: &RegistrySnapshot,
    ) -> (Vec<String>, bool) {
        let scored = snapshot.match_message(message);
        let mut included: Vec<String> = scored
            .iter()
            .filter(|(_, score)| *score >= self.config.include_threshold)
            .map(|(agent, _)| agent.agent_id.clone())
            .collect();

        let contextual_reference = has_contextual_reference(message);
        if contextual_reference {
            if let Some(docs) = snapshot.specialist_for_domain(DOCUMENTS_DOMAIN) {
                if !included.contains(&docs.agent_id) {
                    debug!(agent = %docs.agent_id, "force-including documents specialist");
                    included.push(docs.agent_id.clone());
                }
            }
        }

        // When in doubt, include: substantial queries that matched nothing
        // get every healthy specialist.
        if included.is_empty() && word_count(message) > self.config.general_query_len {
            debug!("no specialist matched a substantial query, including all");
            included = snapshot
                .specialists()
                .filter(|a| a.health != crate::registry::HealthState::Unhealthy)
                .map(|a| a.agent_id.clone())
                .collect();
        }

        (included, contextual_reference)
    }

    /// Ask the coordinator's model for routing guidance. Failures are
    /// non-fatal — selection proceeds without a strategy.
    async fn routing_strategy(
        &self,
        message: &str,
        history_digest: &str,
        snapshot: &RegistrySnapshot,
        participants: &[String],
        cancel: &CancellationToken,
    ) -> Option<String> {
        let roster = snapshot.roster_prompt();
        let names: Vec<&str> = participants.iter().map(|s| s.as_str()).collect();
        let mut prompt = format!(
            "You are the coordinator of a multi-agent system. Analyze this user \
             question and produce a short routing strategy for agent selection.\n\n\
             {roster}\nSELECTED FOR THIS QUESTION: {}\n\nUSER QUESTION: {message}\n",
            names.join(", ")
        );
        if !history_digest.is_empty() {
            prompt.push_str(&format!("\nRECENT CONVERSATION:\n{history_digest}\n"));
        }
        prompt.push_str(
            "\nDescribe which agents should act, in what order, and any \
             dependencies between their steps. Reply with the strategy only.",
        );

        let messages = [Message::user(prompt)];
        match self
            .model
            .generate_text(&messages, &GenerateOptions::plain(0.1, 800), cancel)
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                debug!(chars = text.len(), "routing strategy computed");
                Some(text)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "routing strategy unavailable, continuing without it");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests_support::{failing_client, scripted_client};
    use crate::registry::{AgentDescriptor, AgentRegistry, HealthState};

    fn registry() -> AgentRegistry {
        let registry = AgentRegistry::new();
        registry.register(AgentDescriptor {
            agent_id: "coordinator".into(),
            display_name: "Coordinator".into(),
            description: "general".into(),
            domains: vec![],
            keywords: vec![],
            examples: vec![],
            tools: vec![],
            routing_weight: 1.0,
            health: HealthState::Healthy,
            coordinator: true,
        });
        registry.register(AgentDescriptor {
            agent_id: "db".into(),
            display_name: "DbSpecialist".into(),
            description: "databases".into(),
            domains: vec!["databases".into()],
            keywords: vec!["database".into(), "table".into(), "query".into()],
            examples: vec![],
            tools: vec![],
            routing_weight: 1.0,
            health: HealthState::Healthy,
            coordinator: false,
        });
        registry.register(AgentDescriptor {
            agent_id: "docs".into(),
            display_name: "DocsSpecialist".into(),
            description: "documents".into(),
            domains: vec!["documents".into()],
            keywords: vec!["document".into(), "file".into(), "summarize".into()],
            examples: vec![],
            tools: vec![],
            routing_weight: 1.0,
            health: HealthState::Healthy,
            coordinator: false,
        });
        registry
    }

    fn router() -> Router {
        Router::new(scripted_client(vec!["strategy: go"]), RouterConfig::default())
    }

    #[tokio::test]
    async fn coordinator_always_first() {
        let snapshot = registry().snapshot();
        let selection = router()
            .select("hi", "", &snapshot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(selection.participants[0], "coordinator");
    }

    #[tokio::test]
    async fn specialists_above_threshold_included() {
        let snapshot = registry().snapshot();
        let selection = router()
            .select(
                "query the sales database table",
                "",
                &snapshot,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(selection.participants.contains(&"db".to_string()));
        assert!(!selection.participants.contains(&"docs".to_string()));
    }

    #[tokio::test]
    async fn contextual_reference_forces_documents_specialist() {
        let snapshot = registry().snapshot();
        let selection = router()
            .select("please analyze it", "", &snapshot, &CancellationToken::new())
            .await
            .unwrap();
        assert!(selection.contextual_reference);
        assert!(selection.participants.contains(&"docs".to_string()));
    }

    #[tokio::test]
    async fn explicit_filename_disables_contextual_forcing() {
        assert!(!has_contextual_reference("summarize it from report.pdf"));
        assert!(has_contextual_reference("summarize that document"));
    }

    #[tokio::test]
    async fn unmatched_substantial_query_includes_all() {
        let snapshot = registry().snapshot();
        let selection = router()
            .select(
                "please explain the quarterly results to me",
                "",
                &snapshot,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // Coordinator + both specialists.
        assert_eq!(selection.participants.len(), 3);
    }

    #[tokio::test]
    async fn short_unmatched_query_is_coordinator_only() {
        let snapshot = registry().snapshot();
        let selection = router()
            .select("hello there", "", &snapshot, &CancellationToken::new())
            .await
            .unwrap();
        assert!(selection.is_coordinator_only());
    }

    #[tokio::test]
    async fn selection_is_idempotent() {
        let snapshot = registry().snapshot();
        let r = router();
        let a = r
            .select("query the database", "", &snapshot, &CancellationToken::new())
            .await
            .unwrap();
        let b = r
            .select("query the database", "", &snapshot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(a.participants, b.participants);
    }

    #[tokio::test]
    async fn strategy_failure_is_non_fatal() {
        let snapshot = registry().snapshot();
        let router = Router::new(failing_client(), RouterConfig::default());
        let selection = router
            .select("query the database", "", &snapshot, &CancellationToken::new())
            .await
            .unwrap();
        assert!(selection.strategy.is_none());
        assert!(selection.participants.contains(&"db".to_string()));
    }

    #[tokio::test]
    async fn missing_coordinator_is_input_invalid() {
        let registry = AgentRegistry::new();
        let snapshot = registry.snapshot();
        let err = router()
            .select("hi", "", &snapshot, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::InputInvalid(_)));
    }
}
