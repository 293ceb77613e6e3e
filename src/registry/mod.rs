//! Agent registry: specialist metadata, capabilities, and match scoring.
//!
//! The registry is the single ownership root for agent descriptors. Turns
//! operate on an immutable [`RegistrySnapshot`] so concurrent registry
//! mutations never change a turn's view mid-flight.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AgentEntry;

/// Agent health as reported by operational checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Registry entry describing one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Stable identifier.
    pub agent_id: String,
    pub display_name: String,
    /// One-paragraph domain description.
    pub description: String,
    /// Domain tags (e.g. "databases").
    pub domains: Vec<String>,
    /// Lowercased routing keywords.
    pub keywords: Vec<String>,
    /// Illustrative queries shown in the coordinator's roster prompt.
    pub examples: Vec<String>,
    /// Tool allowlist.
    pub tools: Vec<String>,
    pub routing_weight: f64,
    pub health: HealthState,
    /// Exactly one registered agent should be the coordinator.
    pub coordinator: bool,
}

impl AgentDescriptor {
    /// Build a descriptor from a config roster entry.
    pub fn from_entry(entry: &AgentEntry) -> Self {
        Self {
            agent_id: entry.id.clone(),
            display_name: entry.name.clone(),
            description: entry.description.clone(),
            domains: entry.domains.iter().map(|d| d.to_lowercase()).collect(),
            keywords: entry.keywords.iter().map(|k| k.to_lowercase()).collect(),
            examples: entry.examples.clone(),
            tools: entry.tools.clone(),
            routing_weight: entry.routing_weight,
            health: HealthState::Healthy,
            coordinator: entry.coordinator,
        }
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|t| t == tool_name)
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Bonus added per domain tag appearing in the message.
const DOMAIN_BONUS: f64 = 2.0;

/// Score a message against a descriptor: weighted keyword hits plus
/// domain-tag bonuses. Unhealthy agents never match; degraded agents score
/// at half weight.
pub fn match_score(descriptor: &AgentDescriptor, message: &str) -> f64 {
    if descriptor.health == HealthState::Unhealthy {
        return 0.0;
    }
    let lower = message.to_lowercase();
    let keyword_hits = descriptor
        .keywords
        .iter()
        .filter(|k| !k.is_empty() && lower.contains(k.as_str()))
        .count() as f64;
    let domain_hits = descriptor
        .domains
        .iter()
        .filter(|d| !d.is_empty() && lower.contains(d.as_str()))
        .count() as f64;
    let raw = (keyword_hits + DOMAIN_BONUS * domain_hits) * descriptor.routing_weight;
    if descriptor.health == HealthState::Degraded {
        raw / 2.0
    } else {
        raw
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared registry of agent descriptors. Read-mostly; writes serialized.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<HashMap<String, AgentDescriptor>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the configured roster.
    pub fn from_entries(entries: &[AgentEntry]) -> Self {
        let registry = Self::new();
        for entry in entries {
            registry.register(AgentDescriptor::from_entry(entry));
        }
        registry
    }

    /// Register (or replace) a descriptor. Keywords are lowercased.
    pub fn register(&self, mut descriptor: AgentDescriptor) {
        for k in &mut descriptor.keywords {
            *k = k.to_lowercase();
        }
        for d in &mut descriptor.domains {
            *d = d.to_lowercase();
        }
        debug!(agent = %descriptor.agent_id, "agent registered");
        self.inner
            .write()
            .expect("registry poisoned")
            .insert(descriptor.agent_id.clone(), descriptor);
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        self.inner
            .write()
            .expect("registry poisoned")
            .remove(agent_id)
            .is_some()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.inner
            .read()
            .expect("registry poisoned")
            .get(agent_id)
            .cloned()
    }

    /// All descriptors, ordered by agent id for determinism.
    pub fn list(&self) -> Vec<AgentDescriptor> {
        let mut agents: Vec<AgentDescriptor> = self
            .inner
            .read()
            .expect("registry poisoned")
            .values()
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn set_health(&self, agent_id: &str, health: HealthState) {
        if let Some(d) = self
            .inner
            .write()
            .expect("registry poisoned")
            .get_mut(agent_id)
        {
            d.health = health;
        }
    }

    /// An immutable view for the duration of one turn.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            agents: self.list(),
        }
    }

    /// Agents matching the message, scored and sorted descending.
    pub fn match_message(&self, message: &str) -> Vec<(AgentDescriptor, f64)> {
        self.snapshot().match_message(message)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Consistent registry view captured at the start of a turn.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    agents: Vec<AgentDescriptor>,
}

impl RegistrySnapshot {
    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn coordinator(&self) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.coordinator)
    }

    pub fn specialists(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.agents.iter().filter(|a| !a.coordinator)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    /// Look up by id or display name (selection replies use either).
    pub fn resolve(&self, name: &str) -> Option<&AgentDescriptor> {
        let trimmed = name.trim();
        self.agents.iter().find(|a| {
            a.agent_id.eq_ignore_ascii_case(trimmed)
                || a.display_name.eq_ignore_ascii_case(trimmed)
        })
    }

    /// Find the specialist carrying a domain tag.
    pub fn specialist_for_domain(&self, domain: &str) -> Option<&AgentDescriptor> {
        self.specialists()
            .find(|a| a.domains.iter().any(|d| d == domain))
    }

    /// Specialists scored against the message, sorted by score descending
    /// (ties broken by agent id for determinism).
    pub fn match_message(&self, message: &str) -> Vec<(AgentDescriptor, f64)> {
        let mut scored: Vec<(AgentDescriptor, f64)> = self
            .specialists()
            .map(|a| (a.clone(), match_score(a, message)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.agent_id.cmp(&b.0.agent_id))
        });
        scored
    }

    /// Roster section for the coordinator's system prompt, reflecting the
    /// registry at snapshot time.
    pub fn roster_prompt(&self) -> String {
        let mut out = String::from("AVAILABLE AGENTS:\n");
        for agent in &self.agents {
            out.push_str(&format!(
                "- {}: {}\n",
                agent.display_name, agent.description
            ));
            if !agent.examples.is_empty() {
                out.push_str(&format!("  Examples: {}\n", agent.examples.join("; ")));
            }
        }
        out
    }
}
