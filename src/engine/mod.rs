//! Group chat engine: drives a bounded turn sequence among selected
//! agents and carries the turn from routing through synthesis.
//!
//! One user turn is a single logical task: route, (maybe) fast-path,
//! otherwise iterate (select speaker → invoke → capture → check
//! termination) under the wall-clock deadline, then evaluate completeness,
//! re-route if needed, and synthesize the final answer.

pub mod evaluate;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::{ActivityEvent, ActivityStatus, ActivityStreamer};
use crate::agent::Agent;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::memory::MemoryStore;
use crate::message::{Message, Role};
use crate::models::ModelClient;
use crate::registry::{AgentDescriptor, AgentRegistry, RegistrySnapshot};
use crate::router::{Router, RouterConfig, Selection};
use crate::synthesis::{SynthesisPath, Synthesizer};
use crate::tools::InvocationContext;
use crate::utils::truncate_str;

use evaluate::CompletenessEvaluator;

/// Messages of shared history shown to the speaker-selection model.
const HISTORY_WINDOW: usize = 5;

/// Fast-path replies shorter than this fall back to the group chat.
const MIN_FAST_PATH_LEN: usize = 50;

/// Replies shorter than this are dropped entirely.
const MIN_RESPONSE_LEN: usize = 3;

/// Case-insensitive approval token in coordinator replies.
const APPROVAL_TOKEN: &str = "approved";

/// Marker the engine looks for when collecting session document names.
const DOCUMENT_UPLOADED_MARKER: &str = "Document uploaded successfully:";

/// Engine limits for one turn.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: usize,
    pub turn_timeout: Duration,
    pub reroute_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            turn_timeout: Duration::from_secs(60),
            reroute_iterations: 3,
        }
    }
}

/// Why the turn loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Coordinator issued the approval token.
    Approved,
    /// Iteration cap reached.
    MaxIterations,
    /// Wall-clock deadline elapsed.
    Timeout,
    /// Cooperative cancellation observed.
    Cancelled,
    /// Single-coordinator fast path; the group chat never ran.
    FastPath,
}

/// Turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingFirstResponse,
    Progressing,
    AwaitingSpecialist,
    CoordinatorSynthesizing,
    Terminated(TerminationReason),
}

/// Advance the state machine after an accepted reply.
fn advance_state(state: TurnState, speaker_is_coordinator: bool) -> TurnState {
    match state {
        TurnState::AwaitingFirstResponse => TurnState::Progressing,
        TurnState::Terminated(r) => TurnState::Terminated(r),
        _ => {
            if speaker_is_coordinator {
                // Coordinator spoke without terminating: specialists act next.
                TurnState::AwaitingSpecialist
            } else {
                TurnState::CoordinatorSynthesizing
            }
        }
    }
}

/// One captured response from the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedResponse {
    /// Display name of the responding agent.
    pub agent: String,
    pub content: String,
    /// Produced during re-routing follow-ups.
    pub follow_up: bool,
    /// Synthetic recovery suggestion, never a specialist answer.
    pub recovery: bool,
}

/// The result of one full user turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub answer: String,
    pub responses: Vec<CapturedResponse>,
    pub iterations: usize,
    pub termination: TerminationReason,
    pub synthesis_path: SynthesisPath,
}

/// One resolved participant: runtime agent plus registry descriptor.
struct Participant {
    agent: Arc<dyn Agent>,
    descriptor: AgentDescriptor,
}

/// Mutable turn progress shared with the timeout wrapper.
struct Capture {
    responses: Vec<CapturedResponse>,
    coordinator_response: Option<String>,
    iterations: usize,
    current_agent: Option<String>,
    state: TurnState,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            coordinator_response: None,
            iterations: 0,
            current_agent: None,
            state: TurnState::AwaitingFirstResponse,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives a user message through routing, group chat, evaluation, and
/// synthesis, persisting the result to session memory.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    agents: HashMap<String, Arc<dyn Agent>>,
    router: Router,
    memory: Arc<MemoryStore>,
    model: ModelClient,
    synthesizer: Synthesizer,
    evaluator: CompletenessEvaluator,
    streamer: Arc<ActivityStreamer>,
    config: EngineConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        agents: Vec<Arc<dyn Agent>>,
        router: Router,
        memory: Arc<MemoryStore>,
        model: ModelClient,
        streamer: Arc<ActivityStreamer>,
        config: EngineConfig,
    ) -> Self {
        let budget = memory.budget();
        Self {
            registry,
            agents: agents
                .into_iter()
                .map(|a| (a.id().to_string(), a))
                .collect(),
            router,
            memory,
            model: model.clone(),
            synthesizer: Synthesizer::new(model.clone(), budget),
            evaluator: CompletenessEvaluator::new(model),
            streamer,
            config,
        }
    }

    pub fn streamer(&self) -> Arc<ActivityStreamer> {
        Arc::clone(&self.streamer)
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        Arc::clone(&self.registry)
    }

    /// Process one user message to a final answer.
    pub async fn process_message(
        &self,
        question: &str,
        context: &InvocationContext,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ErrorKind> {
        if question.trim().is_empty() {
            return Err(ErrorKind::InputInvalid("empty question".into()));
        }
        if context.user_id.is_empty() {
            return Err(ErrorKind::InputInvalid("missing user id".into()));
        }
        if context.session_id.is_empty() {
            return Err(ErrorKind::InputInvalid("missing session id".into()));
        }

        self.streamer.publish(ActivityEvent::new(
            &context.session_id,
            "orchestrator",
            "turn",
            ActivityStatus::Starting,
            truncate_str(question, 200),
        ));

        let result = self.process_inner(question, context, cancel).await;

        match &result {
            Ok(outcome) => {
                self.streamer.publish(ActivityEvent::new(
                    &context.session_id,
                    "orchestrator",
                    "turn",
                    ActivityStatus::Completed,
                    truncate_str(&outcome.answer, 200),
                ));
            }
            Err(kind) => {
                self.streamer.publish(ActivityEvent::new(
                    &context.session_id,
                    "orchestrator",
                    "turn",
                    ActivityStatus::Error,
                    kind.user_message(),
                ));
            }
        }
        result
    }

    async fn process_inner(
        &self,
        question: &str,
        context: &InvocationContext,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ErrorKind> {
        let session_id = &context.session_id;

        // Load memory and record the user message.
        self.memory.load(session_id, &context.user_id).await;
        if let Err(e) = self.memory.append(session_id, Message::user(question)).await {
            warn!(session = %session_id, error = %e, "failed to record user message");
        }

        let stats = self.memory.token_stats(session_id).await;
        match self.memory.budget().classify(stats.messages_tokens) {
            crate::tokens::UsageLevel::Critical => {
                warn!(
                    session = %session_id,
                    usage = stats.usage_percentage,
                    "critical memory token usage, optimizing now"
                );
                self.memory.optimize_for_tokens(session_id).await;
            }
            crate::tokens::UsageLevel::Warn => {
                warn!(
                    session = %session_id,
                    usage = stats.usage_percentage,
                    "high memory token usage"
                );
                self.memory.optimize_for_tokens(session_id).await;
            }
            crate::tokens::UsageLevel::Ok => {
                debug!(session = %session_id, usage = stats.usage_percentage, "memory token usage ok");
            }
        }

        // Route. The routing strategy is computed before the fast-path
        // decision so contextual questions can still reach specialists.
        let snapshot = self.registry.snapshot();
        let digest = self.memory.summary(session_id, 500).await;
        let selection = self
            .router
            .select(question, &digest, &snapshot, cancel)
            .await?;

        let participants = self.resolve_participants(&selection, &snapshot)?;
        let multi_part = participants.len() > 2;

        let history = self.memory.history(session_id).await.unwrap_or_default();
        let documents = session_documents(history.messages());
        let enhanced = enhance_question(
            question,
            selection.contextual_reference,
            &documents,
            &digest,
        );

        // Fast path: a singleton coordinator answers directly from memory —
        // never for contextual document questions.
        if selection.is_coordinator_only() && !selection.contextual_reference {
            match self.fast_path(&participants[0], context, cancel).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {
                    info!("fast path reply unusable, falling back to group chat");
                }
                Err(e) => return Err(e),
            }
        }

        // Group chat under the turn deadline.
        let mut local_history: Vec<Message> = history.messages().to_vec();
        if matches!(local_history.last(), Some(m) if m.role == Role::User) {
            local_history.pop();
        }
        local_history.push(Message::user(enhanced.clone()));

        let capture = StdMutex::new(Capture::default());
        let reason = match tokio::time::timeout(
            self.config.turn_timeout,
            self.run_group_loop(
                local_history,
                &participants,
                selection.strategy.as_deref(),
                multi_part,
                question,
                context,
                cancel,
                &capture,
            ),
        )
        .await
        {
            Ok(reason) => reason,
            Err(_) => {
                let stalled = capture.lock().expect("capture poisoned").current_agent.clone();
                if let Some(agent) = stalled {
                    warn!(session = %session_id, agent = %agent, "turn deadline elapsed mid-answer");
                    self.streamer.publish(ActivityEvent::new(
                        session_id,
                        &agent,
                        "timeout",
                        ActivityStatus::Error,
                        "agent did not answer before the turn deadline",
                    ));
                }
                TerminationReason::Timeout
            }
        };

        let (mut all_responses, coordinator_response, iterations) = {
            let c = capture.lock().expect("capture poisoned");
            (c.responses.clone(), c.coordinator_response.clone(), c.iterations)
        };

        if all_responses.is_empty() {
            return Err(match reason {
                TerminationReason::Timeout => {
                    ErrorKind::Timeout("no responses before the turn deadline".into())
                }
                TerminationReason::Cancelled => ErrorKind::Cancelled,
                _ => ErrorKind::ModelFatal("group chat produced no responses".into()),
            });
        }

        let coordinator_name = participants[0].descriptor.display_name.clone();

        // Error recovery: suggestions accompany failed responses.
        let suggestions = evaluate::scan_for_errors(&all_responses, &snapshot, &coordinator_name);
        if !suggestions.is_empty() {
            info!(count = suggestions.len(), "added recovery suggestions");
            all_responses.extend(suggestions);
        }

        // Completeness evaluation and dynamic re-routing.
        if !cancel.is_cancelled() && reason != TerminationReason::Cancelled {
            let expected: Vec<String> = participants
                .iter()
                .map(|p| p.descriptor.display_name.clone())
                .collect();
            let evaluation = self
                .evaluator
                .evaluate(
                    question,
                    &all_responses,
                    &expected,
                    &snapshot.roster_prompt(),
                    cancel,
                )
                .await;
            if !evaluation.is_complete && !evaluation.suggested_agents.is_empty() {
                info!(
                    missing = %evaluation.missing_info,
                    suggested = ?evaluation.suggested_agents,
                    "answer incomplete, attempting re-routing"
                );
                self.reroute(
                    &enhanced,
                    &evaluation.suggested_agents,
                    &evaluation.follow_up_questions,
                    &participants,
                    &snapshot,
                    &mut all_responses,
                    context,
                    cancel,
                )
                .await;
            }
        }

        // Synthesize.
        let specialists: Vec<CapturedResponse> = all_responses
            .iter()
            .filter(|r| !r.recovery && r.agent != coordinator_name)
            .cloned()
            .collect();
        let roster_names: Vec<String> = snapshot
            .specialists()
            .map(|a| a.display_name.clone())
            .collect();
        let outcome = self
            .synthesizer
            .synthesize(
                question,
                &specialists,
                coordinator_response.as_deref(),
                &roster_names,
                cancel,
            )
            .await;

        if let Err(e) = self
            .memory
            .append(session_id, Message::assistant(outcome.text.clone()))
            .await
        {
            warn!(session = %session_id, error = %e, "failed to record final answer");
        }
        self.memory.save(session_id, &context.user_id).await;

        info!(
            session = %session_id,
            iterations,
            responses = all_responses.len(),
            path = ?outcome.path,
            termination = ?reason,
            answer_len = outcome.text.len(),
            "turn completed"
        );

        Ok(TurnOutcome {
            answer: outcome.text,
            responses: all_responses,
            iterations,
            termination: reason,
            synthesis_path: outcome.path,
        })
    }

    /// Resolve participant ids to runtime agents; the coordinator must exist.
    fn resolve_participants(
        &self,
        selection: &Selection,
        snapshot: &RegistrySnapshot,
    ) -> Result<Vec<Participant>, ErrorKind> {
        let mut participants = Vec::with_capacity(selection.participants.len());
        for (i, id) in selection.participants.iter().enumerate() {
            let agent = self.agents.get(id).cloned();
            let descriptor = snapshot.get(id).cloned();
            match (agent, descriptor) {
                (Some(agent), Some(descriptor)) => {
                    participants.push(Participant { agent, descriptor })
                }
                _ if i == 0 => {
                    return Err(ErrorKind::InputInvalid(
                        "coordinator agent is not available".into(),
                    ));
                }
                _ => {
                    warn!(agent = %id, "selected agent has no runtime instance, skipping");
                }
            }
        }
        Ok(participants)
    }

    /// Single-coordinator fast path. `Ok(None)` means fall back to the
    /// group chat.
    async fn fast_path(
        &self,
        coordinator: &Participant,
        context: &InvocationContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnOutcome>, ErrorKind> {
        let session_id = &context.session_id;
        info!(session = %session_id, "fast path: coordinator only");
        let history = self.memory.history(session_id).await.unwrap_or_default();
        match coordinator
            .agent
            .answer(history.messages(), context, cancel)
            .await
        {
            Ok(reply) if reply.content.trim().len() >= MIN_FAST_PATH_LEN => {
                let answer = reply.content.trim().to_string();
                if let Err(e) = self
                    .memory
                    .append(session_id, Message::assistant(answer.clone()))
                    .await
                {
                    warn!(session = %session_id, error = %e, "failed to record fast-path answer");
                }
                self.memory.save(session_id, &context.user_id).await;
                Ok(Some(TurnOutcome {
                    answer: answer.clone(),
                    responses: vec![CapturedResponse {
                        agent: coordinator.descriptor.display_name.clone(),
                        content: answer,
                        follow_up: false,
                        recovery: false,
                    }],
                    iterations: 1,
                    termination: TerminationReason::FastPath,
                    synthesis_path: SynthesisPath::CoordinatorOnly,
                }))
            }
            Ok(reply) => {
                debug!(len = reply.content.len(), "fast path reply too short");
                Ok(None)
            }
            Err(ErrorKind::Cancelled) => Err(ErrorKind::Cancelled),
            Err(e) => {
                warn!(error = %e, "fast path failed");
                Ok(None)
            }
        }
    }

    /// The bounded turn loop. Returns how it ended; progress accumulates in
    /// `capture` so the timeout wrapper can salvage partial work.
    #[allow(clippy::too_many_arguments)]
    async fn run_group_loop(
        &self,
        mut local_history: Vec<Message>,
        participants: &[Participant],
        strategy: Option<&str>,
        multi_part: bool,
        question: &str,
        context: &InvocationContext,
        cancel: &CancellationToken,
        capture: &StdMutex<Capture>,
    ) -> TerminationReason {
        let coordinator_name = participants[0].descriptor.display_name.clone();

        for iteration in 0..self.config.max_iterations {
            if cancel.is_cancelled() {
                capture.lock().expect("capture poisoned").state =
                    TurnState::Terminated(TerminationReason::Cancelled);
                return TerminationReason::Cancelled;
            }

            let any_specialist = {
                let c = capture.lock().expect("capture poisoned");
                c.responses.iter().any(|r| r.agent != coordinator_name)
            };

            let idx = self
                .pick_speaker(
                    participants,
                    &local_history,
                    strategy,
                    question,
                    any_specialist,
                    cancel,
                )
                .await;
            let participant = &participants[idx];
            let name = participant.descriptor.display_name.clone();
            let is_coordinator = idx == 0;

            {
                let mut c = capture.lock().expect("capture poisoned");
                c.current_agent = Some(name.clone());
                c.iterations = iteration + 1;
            }
            debug!(iteration, speaker = %name, "speaker selected");
            self.streamer.publish(ActivityEvent::new(
                &context.session_id,
                &name,
                "answering",
                ActivityStatus::Starting,
                "",
            ));

            let reply = match participant
                .agent
                .answer(&local_history, context, cancel)
                .await
            {
                Ok(reply) => reply,
                Err(ErrorKind::Cancelled) => {
                    capture.lock().expect("capture poisoned").state =
                        TurnState::Terminated(TerminationReason::Cancelled);
                    return TerminationReason::Cancelled;
                }
                Err(e) => {
                    warn!(speaker = %name, error = %e, "agent failed to answer, continuing");
                    self.streamer.publish(ActivityEvent::new(
                        &context.session_id,
                        &name,
                        "answering",
                        ActivityStatus::Error,
                        e.user_message(),
                    ));
                    capture.lock().expect("capture poisoned").current_agent = None;
                    continue;
                }
            };

            capture.lock().expect("capture poisoned").current_agent = None;

            let content = reply.content.trim().to_string();
            if content.len() < MIN_RESPONSE_LEN {
                debug!(speaker = %name, "skipping empty/short response");
                continue;
            }
            let duplicate = {
                let c = capture.lock().expect("capture poisoned");
                c.responses
                    .iter()
                    .any(|r| r.agent == name && r.content == content)
            };
            if duplicate {
                debug!(speaker = %name, "skipping duplicate response");
                continue;
            }

            local_history.push(reply);
            {
                let mut c = capture.lock().expect("capture poisoned");
                c.responses.push(CapturedResponse {
                    agent: name.clone(),
                    content: content.clone(),
                    follow_up: false,
                    recovery: false,
                });
                if is_coordinator {
                    c.coordinator_response = Some(content.clone());
                }
                c.state = advance_state(c.state, is_coordinator);
            }
            self.streamer.publish(ActivityEvent::new(
                &context.session_id,
                &name,
                "answering",
                ActivityStatus::Completed,
                truncate_str(&content, 200),
            ));

            // Termination: coordinator approval, gated on specialist
            // contribution for multi-part queries.
            if is_coordinator && content.to_lowercase().contains(APPROVAL_TOKEN) {
                let specialist_contributed = {
                    let c = capture.lock().expect("capture poisoned");
                    c.responses.iter().any(|r| r.agent != coordinator_name)
                };
                if !multi_part || specialist_contributed {
                    info!(iterations = iteration + 1, "coordinator approved, terminating");
                    capture.lock().expect("capture poisoned").state =
                        TurnState::Terminated(TerminationReason::Approved);
                    return TerminationReason::Approved;
                }
            }
        }

        info!(cap = self.config.max_iterations, "iteration cap reached");
        capture.lock().expect("capture poisoned").state =
            TurnState::Terminated(TerminationReason::MaxIterations);
        TerminationReason::MaxIterations
    }

    /// Speaker selection: dynamic strategy guidance via the chat model,
    /// keyword routing as fallback, coordinator as the default once a
    /// specialist has contributed.
    async fn pick_speaker(
        &self,
        participants: &[Participant],
        history: &[Message],
        strategy: Option<&str>,
        question: &str,
        any_specialist_responded: bool,
        cancel: &CancellationToken,
    ) -> usize {
        if participants.len() == 1 {
            return 0;
        }

        let mut prompt = String::from(
            "Determine which agent should respond next based on the \
             conversation so far.\n\nPARTICIPANTS:\n",
        );
        for p in participants {
            prompt.push_str(&format!(
                "- {}: {}\n",
                p.descriptor.display_name, p.descriptor.description
            ));
        }
        if let Some(strategy) = strategy {
            prompt.push_str(&format!(
                "\nROUTING STRATEGY (primary guidance):\n{strategy}\n"
            ));
        }
        prompt.push_str("\nRECENT CONVERSATION:\n");
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        for msg in &history[start..] {
            let who = msg.name.as_deref().unwrap_or(msg.role.as_str());
            prompt.push_str(&format!("[{who}]: {}\n", truncate_str(&msg.content, 300)));
        }
        prompt.push_str(
            "\nReturn ONLY the agent name with no additional text or explanation.",
        );

        match self
            .model
            .generate_text(
                &[Message::user(prompt)],
                &crate::models::GenerateOptions::plain(0.0, 30),
                cancel,
            )
            .await
        {
            Ok(reply) => {
                if let Some(idx) = parse_speaker(&reply, participants) {
                    return idx;
                }
                debug!(reply = %truncate_str(&reply, 80), "ambiguous speaker reply, using fallback");
            }
            Err(e) => {
                debug!(error = %e, "speaker selection model call failed, using fallback");
            }
        }

        // Keyword routing table fallback; coordinator synthesizes once a
        // specialist has contributed.
        if any_specialist_responded {
            return 0;
        }
        let mut best: Option<(usize, f64)> = None;
        for (idx, p) in participants.iter().enumerate().skip(1) {
            let score = crate::registry::match_score(&p.descriptor, question);
            if score > 0.0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((idx, score));
            }
        }
        best.map(|(idx, _)| idx).unwrap_or(0)
    }

    /// Re-routing follow-ups: one question per suggested agent, bounded by
    /// the configured cap, against a transcript-shaped history.
    #[allow(clippy::too_many_arguments)]
    async fn reroute(
        &self,
        enhanced_question: &str,
        suggested_agents: &[String],
        follow_up_questions: &[String],
        participants: &[Participant],
        snapshot: &RegistrySnapshot,
        all_responses: &mut Vec<CapturedResponse>,
        context: &InvocationContext,
        cancel: &CancellationToken,
    ) {
        let current: Vec<&str> = participants
            .iter()
            .map(|p| p.descriptor.display_name.as_str())
            .collect();
        let new_agents: Vec<&AgentDescriptor> = suggested_agents
            .iter()
            .filter_map(|name| snapshot.resolve(name))
            .filter(|d| !current.iter().any(|c| c.eq_ignore_ascii_case(&d.display_name)))
            .collect();
        if new_agents.is_empty() {
            debug!("all suggested agents already participated, skipping re-routing");
            return;
        }

        // Transcript-shaped context for follow-up answers.
        let mut base_history = vec![Message::user(enhanced_question)];
        for r in all_responses.iter().filter(|r| !r.recovery) {
            base_history.push(Message::assistant(format!("[{}]: {}", r.agent, r.content)));
        }

        let pairs = follow_up_questions
            .iter()
            .zip(suggested_agents.iter())
            .take(self.config.reroute_iterations);
        for (follow_up, agent_name) in pairs {
            if cancel.is_cancelled() {
                return;
            }
            let Some(descriptor) = snapshot.resolve(agent_name) else {
                warn!(agent = %agent_name, "suggested agent not in registry");
                continue;
            };
            let Some(agent) = self.agents.get(&descriptor.agent_id) else {
                warn!(agent = %agent_name, "suggested agent has no runtime instance");
                continue;
            };

            info!(agent = %descriptor.display_name, "sending follow-up question");
            let mut history = base_history.clone();
            history.push(Message::user(format!(
                "[FOLLOW-UP REQUEST for {}]: {}",
                descriptor.display_name, follow_up
            )));

            match agent.answer(&history, context, cancel).await {
                Ok(reply) if reply.content.trim().len() > 10 => {
                    let content = reply.content.trim().to_string();
                    base_history.push(Message::assistant(format!(
                        "[{}]: {}",
                        descriptor.display_name, content
                    )));
                    all_responses.push(CapturedResponse {
                        agent: descriptor.display_name.clone(),
                        content,
                        follow_up: true,
                        recovery: false,
                    });
                }
                Ok(_) => debug!(agent = %descriptor.display_name, "follow-up reply too short"),
                Err(e) => warn!(agent = %descriptor.display_name, error = %e, "follow-up failed"),
            }
        }
    }
}

/// Match a selection reply against participant names.
fn parse_speaker(reply: &str, participants: &[Participant]) -> Option<usize> {
    let first_line = reply.lines().next().unwrap_or("");
    let cleaned: String = first_line
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == ':' || c == '*')
        .to_string();
    if cleaned.is_empty() {
        return None;
    }
    participants.iter().position(|p| {
        p.descriptor.display_name.eq_ignore_ascii_case(&cleaned)
            || p.descriptor.agent_id.eq_ignore_ascii_case(&cleaned)
    })
}

/// Collect filenames announced by prior upload confirmations.
fn session_documents(history: &[Message]) -> Vec<String> {
    let mut documents = Vec::new();
    for msg in history {
        if msg.role != Role::Assistant {
            continue;
        }
        for line in msg.content.lines() {
            if let Some(rest) = line.trim().strip_prefix(DOCUMENT_UPLOADED_MARKER) {
                let name = rest.trim().to_string();
                if !name.is_empty() && !documents.contains(&name) {
                    documents.push(name);
                }
            }
        }
    }
    documents
}

/// Prefix the question with document and conversation context.
fn enhance_question(
    question: &str,
    contextual_reference: bool,
    documents: &[String],
    digest: &str,
) -> String {
    let mut enhanced = if contextual_reference && !documents.is_empty() {
        let listing: String = documents
            .iter()
            .map(|d| format!("- {d}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "DOCUMENT CONTEXT - documents available in this session:\n{listing}\n\n\
             User question: {question}\n\n\
             Note: the user may be referring to one of these documents."
        )
    } else if contextual_reference {
        format!(
            "The user is referring to a document contextually, but no session \
             documents were found. The documents specialist should check \
             storage before answering.\n\nUser question: {question}"
        )
    } else {
        question.to_string()
    };
    if !digest.is_empty() {
        enhanced = format!("Previous conversation context:\n{digest}\n\n{enhanced}");
    }
    enhanced
}

// ---------------------------------------------------------------------------
// Config wiring
// ---------------------------------------------------------------------------

impl Orchestrator {
    /// Build a fully wired orchestrator from configuration: OpenAI-compatible
    /// chat model, optional HTTP tool endpoint, and one model-backed agent
    /// per roster entry. The coordinator's instructions are extended with
    /// the registry roster so its behavior tracks registry contents.
    pub fn from_config(
        config: &Config,
        persistence: Arc<dyn crate::memory::HistoryPersistence>,
    ) -> anyhow::Result<Self> {
        let model = ModelClient::new(Arc::new(crate::models::OpenAICompatModel::new(
            config.model.endpoint.clone(),
            config.model.resolved_api_key(),
            config.model.model.clone(),
        )));
        let registry = Arc::new(AgentRegistry::from_entries(&config.agents));
        let streamer = Arc::new(ActivityStreamer::new(config.activity_buffer));

        let mediator = config.tool_endpoint.as_ref().map(|tep| {
            Arc::new(crate::tools::ToolMediator::new(
                Arc::new(crate::tools::endpoint::HttpToolEndpoint::new(
                    tep.url.clone(),
                    tep.resolved_api_key(),
                    config.tool_stream_timeout(),
                )),
                Arc::clone(&registry),
                Arc::clone(&streamer),
                config.tool_request_timeout(),
                tep.timeout_overrides(),
            ))
        });

        let roster = registry.snapshot().roster_prompt();
        let mut agents: Vec<Arc<dyn Agent>> = Vec::with_capacity(config.agents.len());
        for entry in &config.agents {
            let mut instructions = entry
                .instructions
                .clone()
                .unwrap_or_else(|| format!("You are {}. {}", entry.name, entry.description));
            if entry.coordinator {
                instructions.push_str("\n\n");
                instructions.push_str(&roster);
                instructions.push_str(
                    "\nWhen every part of the question has been answered, reply \
                     with a final summary containing the word \"Approved\".",
                );
            }
            agents.push(Arc::new(crate::agent::ModelAgent::new(
                entry.id.clone(),
                entry.name.clone(),
                instructions,
                model.clone(),
                mediator.clone(),
                config.response_reserve_tokens,
            )));
        }

        let memory = Arc::new(MemoryStore::new(
            persistence,
            config.budget(),
            config.max_history_messages,
            config
                .system_prompt
                .clone()
                .unwrap_or_else(|| "You are a helpful assistant.".to_string()),
        ));
        let router = Router::new(
            model.clone(),
            RouterConfig {
                include_threshold: config.include_threshold,
                general_query_len: 4,
            },
        );

        Ok(Self::new(
            registry,
            agents,
            router,
            memory,
            model,
            streamer,
            EngineConfig {
                max_iterations: config.max_iterations,
                turn_timeout: config.turn_timeout(),
                reroute_iterations: config.reroute_iterations,
            },
        ))
    }
}
