//! Final-answer synthesis.
//!
//! Merges specialist and coordinator outputs into one user-facing answer.
//! A token pre-check routes oversized inputs to a deterministic emergency
//! path that never calls the chat model; otherwise a decision tree prefers
//! answers that already exist over a synthesis model call. Citations
//! (`[Doc N]` tokens and `Sources:` URLs) survive every non-emergency path.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::CapturedResponse;
use crate::message::Message;
use crate::models::{GenerateOptions, ModelClient};
use crate::tokens::{self, TokenBudget};

/// Token estimate for the synthesis prompt scaffolding.
const SYNTHESIS_OVERHEAD_TOKENS: usize = 1_000;

/// A coordinator reply longer than this counts as substantial.
const SUBSTANTIAL_COORDINATOR_LEN: usize = 200;

/// Model-path answers shorter than this fall back to the join path.
const MIN_MODEL_ANSWER_LEN: usize = 20;

/// Phrases suggesting the coordinator already synthesized specialist data.
const SYNTHESIS_INDICATORS: &[&str] = &[
    "based on",
    "according to",
    "the results show",
    "combining the information",
    "together these findings",
    "in summary",
    "to summarize",
    "from the analysis",
    "the findings indicate",
    "the evidence shows",
    "after checking",
    "upon examination",
];

/// Phrases marking a coordinator reply as a deferral, excluded from joins.
const DEFERRAL_INDICATORS: &[&str] = &[
    "specialist",
    "defer",
    "better suited",
    "route this",
    "more appropriate",
];

/// Which branch of the decision tree produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisPath {
    /// Deterministic bullet summary; the model was never called.
    Emergency,
    /// The coordinator's reply already synthesized the specialists.
    CoordinatorPreSynthesized,
    /// Only the coordinator responded.
    CoordinatorOnly,
    /// Exactly one specialist responded and the coordinator did not.
    SingleSpecialist,
    /// Model-merged answer.
    Model,
    /// Plain concatenation after a model failure or short reply.
    FallbackJoin,
}

/// The synthesized answer plus the path that produced it.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub text: String,
    pub path: SynthesisPath,
}

/// Merges specialist outputs into a single coherent answer.
pub struct Synthesizer {
    model: ModelClient,
    budget: TokenBudget,
}

impl Synthesizer {
    pub fn new(model: ModelClient, budget: TokenBudget) -> Self {
        Self { model, budget }
    }

    /// Produce the final answer.
    ///
    /// `roster_names` are the display names of participating specialists,
    /// used to detect coordinator replies that already reference them.
    pub async fn synthesize(
        &self,
        question: &str,
        specialists: &[CapturedResponse],
        coordinator: Option<&str>,
        roster_names: &[String],
        cancel: &CancellationToken,
    ) -> SynthesisOutcome {
        let coordinator = coordinator.map(str::trim).filter(|c| !c.is_empty());
        if specialists.is_empty() && coordinator.is_none() {
            return SynthesisOutcome {
                text: "No response generated".into(),
                path: SynthesisPath::FallbackJoin,
            };
        }

        // Emergency pre-check: combined content plus prompt scaffolding must
        // leave room for the response reserve.
        let mut total = tokens::count(question).padded();
        for r in specialists {
            total += tokens::count(&r.content).padded() + tokens::count(&r.agent).padded();
        }
        if let Some(c) = coordinator {
            total += tokens::count(c).padded();
        }
        let ceiling = self
            .budget
            .safe_limit()
            .saturating_sub(self.budget.response_reserve);
        if total + SYNTHESIS_OVERHEAD_TOKENS > ceiling {
            warn!(
                tokens = total,
                ceiling, "combined responses too large for model synthesis, using emergency path"
            );
            return SynthesisOutcome {
                text: emergency_summary(specialists, coordinator),
                path: SynthesisPath::Emergency,
            };
        }

        // Drop duplicate responses from the same agent.
        let unique = dedup_by_agent(specialists);

        let citations = collect_citations(unique.iter().map(|r| r.content.as_str()));

        // A substantial coordinator reply that already reads like a
        // synthesis and names a specialist is the final answer.
        if let Some(c) = coordinator {
            if c.len() > SUBSTANTIAL_COORDINATOR_LEN && !unique.is_empty() {
                let lower = c.to_lowercase();
                let appears_synthesized =
                    SYNTHESIS_INDICATORS.iter().any(|ind| lower.contains(ind));
                let mentions_specialist = unique
                    .iter()
                    .map(|r| r.agent.as_str())
                    .chain(roster_names.iter().map(|s| s.as_str()))
                    .any(|name| !name.is_empty() && lower.contains(&name.to_lowercase()));
                if appears_synthesized && mentions_specialist {
                    debug!("coordinator reply already synthesized, returning it directly");
                    return SynthesisOutcome {
                        text: ensure_citations(c.to_string(), &citations),
                        path: SynthesisPath::CoordinatorPreSynthesized,
                    };
                }
            }
            if unique.is_empty() {
                return SynthesisOutcome {
                    text: c.to_string(),
                    path: SynthesisPath::CoordinatorOnly,
                };
            }
        }

        if unique.len() == 1 && coordinator.is_none() {
            return SynthesisOutcome {
                text: unique[0].content.clone(),
                path: SynthesisPath::SingleSpecialist,
            };
        }

        match self
            .model_synthesis(question, &unique, coordinator, cancel)
            .await
        {
            Some(text) if text.len() >= MIN_MODEL_ANSWER_LEN => SynthesisOutcome {
                text: ensure_citations(text, &citations),
                path: SynthesisPath::Model,
            },
            Some(_) | None => {
                info!("model synthesis unusable, joining responses directly");
                SynthesisOutcome {
                    text: ensure_citations(join_responses(&unique, coordinator), &citations),
                    path: SynthesisPath::FallbackJoin,
                }
            }
        }
    }

    /// The model-synthesis path. Returns `None` on model failure.
    async fn model_synthesis(
        &self,
        question: &str,
        specialists: &[CapturedResponse],
        coordinator: Option<&str>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let question_tokens = tokens::count(question).padded();
        let coordinator_tokens = coordinator.map(|c| tokens::count(c).padded()).unwrap_or(0);
        let available_for_specialist = self
            .budget
            .safe_limit()
            .saturating_sub(self.budget.response_reserve)
            .saturating_sub(self.budget.prompt_overhead)
            .saturating_sub(question_tokens)
            .saturating_sub(coordinator_tokens);

        let sections = fit_specialist_sections(specialists, available_for_specialist);

        let mut prompt = format!(
            "You are the coordinator of a multi-agent system. Synthesize the \
             specialist responses below into one coherent answer for the user.\n\n\
             ORIGINAL USER QUESTION:\n{question}\n\nSPECIALIST RESPONSES:\n{sections}\n"
        );
        if let Some(c) = coordinator {
            prompt.push_str(&format!("\nCOORDINATOR CONTEXT:\n{c}\n"));
        }
        prompt.push_str(
            "\nGuidelines:\n\
             - Start with a direct answer, then supporting details.\n\
             - Remove redundancy and resolve conflicts between responses.\n\
             - Do not mention agent names; answer as one assistant.\n\
             - Preserve every citation token like [Doc 1] and every \
             \"Sources:\" list verbatim.\n",
        );

        let options = GenerateOptions {
            temperature: 0.3,
            max_tokens: self.budget.response_reserve,
            tools: Vec::new(),
        };
        match self
            .model
            .generate_text(&[Message::user(prompt)], &options, cancel)
            .await
        {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) => {
                warn!(error = %e, "model synthesis failed");
                None
            }
        }
    }
}

/// Keep the first response per agent name.
fn dedup_by_agent(responses: &[CapturedResponse]) -> Vec<CapturedResponse> {
    let mut seen = std::collections::HashSet::new();
    responses
        .iter()
        .filter(|r| seen.insert(r.agent.clone()))
        .cloned()
        .collect()
}

/// Render labeled specialist sections, truncating in order once the token
/// allowance is exhausted.
fn fit_specialist_sections(specialists: &[CapturedResponse], allowance: usize) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(specialists.len());
    let mut used = 0usize;
    let mut truncated = false;
    let original: usize = specialists
        .iter()
        .map(|r| tokens::count(&r.content).padded())
        .sum();

    for r in specialists {
        let label = if r.follow_up {
            format!("**{} (Follow-up)**", r.agent)
        } else {
            format!("**{}**", r.agent)
        };
        let section = format!("{label}:\n{}", r.content);
        let cost = tokens::count(&section).padded();
        if used + cost <= allowance {
            used += cost;
            sections.push(section);
        } else {
            let remaining = allowance.saturating_sub(used);
            if remaining > 100 {
                let max_chars = (remaining as f64 * 3.5) as usize;
                let cut = crate::utils::truncate_str(&section, max_chars);
                sections.push(format!("{cut} [TRUNCATED DUE TO TOKEN LIMITS]"));
            }
            truncated = true;
            break;
        }
    }
    if truncated {
        warn!(
            original_tokens = original,
            allowance, "specialist responses truncated for synthesis prompt"
        );
    }
    sections.join("\n")
}

/// Fallback join: coordinator context (when substantive and not a
/// deferral), then each specialist response, blank-line separated.
fn join_responses(specialists: &[CapturedResponse], coordinator: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(c) = coordinator {
        let lower = c.to_lowercase();
        let is_deferral = DEFERRAL_INDICATORS.iter().any(|d| lower.contains(d));
        if c.len() > 10 && !is_deferral {
            parts.push(c.to_string());
        }
    }
    for r in specialists {
        if r.content.len() > 10 {
            parts.push(r.content.clone());
        }
    }
    if parts.is_empty() {
        specialists
            .iter()
            .map(|r| r.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n")
    } else {
        parts.join("\n\n")
    }
}

/// Deterministic bullet summary used when the token budget rules out a
/// model call.
fn emergency_summary(specialists: &[CapturedResponse], coordinator: Option<&str>) -> String {
    if let Some(c) = coordinator {
        if c.len() > 100 {
            return format!("Response: {}", crate::utils::truncate_str(c, 500));
        }
    }
    let mut insights: Vec<String> = Vec::new();
    for r in specialists.iter().take(3) {
        let content = r.content.trim();
        if content.is_empty() {
            continue;
        }
        let first = match content.find('.') {
            Some(pos) if pos > 0 => &content[..=pos],
            _ => content,
        };
        insights.push(crate::utils::truncate_str(first, 200));
    }
    match insights.len() {
        0 => "No detailed response available (emergency mode).".into(),
        1 => format!("Response: {}", insights[0]),
        _ => format!(
            "Multiple insights found:\n{}",
            insights
                .iter()
                .map(|i| format!("• {i}"))
                .collect::<Vec<_>>()
                .join("\n")
        ),
    }
}

// ---------------------------------------------------------------------------
// Citation preservation
// ---------------------------------------------------------------------------

/// Citations harvested from specialist responses.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Citations {
    /// Inline `[Doc N]` tokens, in first-seen order.
    pub doc_tags: Vec<String>,
    /// URLs from `Sources:` sections, in first-seen order.
    pub urls: Vec<String>,
}

/// Harvest `[Doc N]` tokens and `Sources:` URLs from inputs.
pub fn collect_citations<'a>(texts: impl Iterator<Item = &'a str>) -> Citations {
    let mut citations = Citations::default();
    for text in texts {
        let mut rest = text;
        while let Some(start) = rest.find("[Doc ") {
            let tail = &rest[start..];
            match tail.find(']') {
                Some(end) if end < 16 => {
                    let tag = &tail[..=end];
                    if !citations.doc_tags.iter().any(|t| t == tag) {
                        citations.doc_tags.push(tag.to_string());
                    }
                    rest = &tail[end + 1..];
                }
                _ => break,
            }
        }
        if let Some(pos) = text.find("Sources:") {
            for token in text[pos..].split_whitespace() {
                let trimmed = token.trim_end_matches([',', '.', ';', ')']);
                if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
                    if !citations.urls.iter().any(|u| u == trimmed) {
                        citations.urls.push(trimmed.to_string());
                    }
                }
            }
        }
    }
    citations
}

/// Append any citation lost during synthesis so every input `[Doc N]` token
/// and `Sources:` URL appears in the final answer.
fn ensure_citations(mut text: String, citations: &Citations) -> String {
    let missing_tags: Vec<&String> = citations
        .doc_tags
        .iter()
        .filter(|t| !text.contains(t.as_str()))
        .collect();
    let missing_urls: Vec<&String> = citations
        .urls
        .iter()
        .filter(|u| !text.contains(u.as_str()))
        .collect();
    if !missing_tags.is_empty() {
        text.push_str("\n\nCitations: ");
        text.push_str(
            &missing_tags
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
    }
    if !missing_urls.is_empty() {
        text.push_str("\n\nSources:\n");
        for url in missing_urls {
            text.push_str(&format!("- {url}\n"));
        }
    }
    text
}
