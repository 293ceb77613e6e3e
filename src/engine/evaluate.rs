//! Completeness evaluation and error recovery.
//!
//! After the group chat terminates, the coordinator's model judges whether
//! the captured responses fully answer the question and proposes follow-up
//! work for re-routing. Responses are also scanned for failure phrasing so
//! recovery suggestions can accompany (never replace) failed answers.

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::CapturedResponse;
use crate::message::Message;
use crate::models::{GenerateOptions, ModelClient};
use crate::registry::RegistrySnapshot;
use crate::utils::truncate_str;

/// Phrases that flag a response as a probable failure.
const ERROR_INDICATORS: &[&str] = &[
    "error",
    "failed",
    "exception",
    "unable to",
    "could not",
    "timeout",
];

/// Structured completeness verdict.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Evaluation {
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub missing_info: String,
    #[serde(default)]
    pub suggested_agents: Vec<String>,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Judges answer completeness via the coordinator's chat model.
pub struct CompletenessEvaluator {
    model: ModelClient,
}

impl CompletenessEvaluator {
    pub fn new(model: ModelClient) -> Self {
        Self { model }
    }

    /// Evaluate whether `responses` fully answer `question`.
    ///
    /// Falls back to a count heuristic when the model reply cannot be
    /// parsed: complete iff every expected agent produced a response.
    pub async fn evaluate(
        &self,
        question: &str,
        responses: &[CapturedResponse],
        expected_agents: &[String],
        roster: &str,
        cancel: &CancellationToken,
    ) -> Evaluation {
        let summary: String = responses
            .iter()
            .map(|r| format!("**{}**: {}", r.agent, truncate_str(&r.content, 300)))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You are the coordinator evaluating whether the user's question has \
             been fully answered.\n\n\
             ORIGINAL QUESTION:\n{question}\n\n\
             EXPECTED AGENTS: {}\n\nRESPONSES SO FAR:\n{summary}\n\n{roster}\n\
             Analyze whether the question is completely answered and what \
             additional actions are needed.\n\n\
             RESPOND IN JSON FORMAT:\n\
             {{\n  \"is_complete\": true,\n  \"missing_info\": \"\",\n  \
             \"suggested_agents\": [],\n  \"follow_up_questions\": [],\n  \
             \"reasoning\": \"\"\n}}\n",
            expected_agents.join(", ")
        );

        let fallback = || Evaluation {
            is_complete: responses.len() >= expected_agents.len(),
            ..Evaluation::default()
        };

        match self
            .model
            .generate_text(
                &[Message::user(prompt)],
                &GenerateOptions::plain(0.2, 300),
                cancel,
            )
            .await
        {
            Ok(reply) => match parse_evaluation(&reply) {
                Some(evaluation) => {
                    debug!(
                        is_complete = evaluation.is_complete,
                        suggested = ?evaluation.suggested_agents,
                        "completeness evaluated"
                    );
                    evaluation
                }
                None => {
                    warn!("could not parse completeness reply, using count heuristic");
                    fallback()
                }
            },
            Err(e) => {
                warn!(error = %e, "completeness evaluation failed, using count heuristic");
                fallback()
            }
        }
    }
}

/// Extract the JSON object between the first `{` and the last `}`.
fn parse_evaluation(reply: &str) -> Option<Evaluation> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

/// Scan responses for failure phrasing and synthesize recovery suggestions
/// pointing at an alternate specialist. Suggestions accompany the failed
/// response, they never replace it.
pub fn scan_for_errors(
    responses: &[CapturedResponse],
    snapshot: &RegistrySnapshot,
    coordinator_name: &str,
) -> Vec<CapturedResponse> {
    let mut suggestions = Vec::new();
    for response in responses {
        if response.recovery {
            continue;
        }
        let lower = response.content.to_lowercase();
        if !ERROR_INDICATORS.iter().any(|ind| lower.contains(ind)) {
            continue;
        }
        let alternate = snapshot
            .specialists()
            .find(|a| {
                !a.display_name.eq_ignore_ascii_case(&response.agent)
                    && a.health != crate::registry::HealthState::Unhealthy
            })
            .map(|a| a.display_name.clone());
        let mut content = format!(
            "{} reported a problem: {}",
            response.agent,
            truncate_str(&response.content, 100)
        );
        if let Some(alt) = alternate {
            content.push_str(&format!(
                " An alternative approach via {alt} may recover the missing information."
            ));
        }
        suggestions.push(CapturedResponse {
            agent: coordinator_name.to_string(),
            content,
            follow_up: false,
            recovery: true,
        });
    }
    suggestions
}
