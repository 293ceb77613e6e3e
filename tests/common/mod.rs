//! Shared doubles for orchestrator integration tests: a playbook-driven
//! chat model, a recording tool transport, and an in-memory persistence
//! store.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use roundtable::memory::HistoryPersistence;
use roundtable::message::{Message, Role, ToolCall};
use roundtable::models::{ChatModel, GenerateOptions, ModelError, ModelReply};
use roundtable::tools::{InvocationContext, ToolSpec, ToolTransport, TransportError};

/// One scripted agent reply.
#[derive(Clone)]
pub enum Reply {
    Final(String),
    ToolCalls(Vec<ToolCall>),
    /// Never answers within any reasonable deadline.
    Stall,
}

/// Chat model double that answers each kind of orchestrator prompt from its
/// own script. Prompts are recognized by the markers the orchestrator puts
/// in them; agent answers are dispatched by the `agent:<Name>` instruction
/// prefix the tests give their agents.
#[derive(Default)]
pub struct PlaybookModel {
    pub strategy: String,
    pub speakers: Mutex<VecDeque<String>>,
    pub evaluations: Mutex<VecDeque<String>>,
    pub synthesis: Mutex<VecDeque<String>>,
    pub agent_replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    /// Every prompt text this model has seen, for assertions.
    pub seen_prompts: Mutex<Vec<String>>,
}

impl PlaybookModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            strategy: "Route specialists first, then let the coordinator approve.".into(),
            ..Self::default()
        })
    }

    pub fn push_speakers(&self, names: &[&str]) {
        let mut speakers = self.speakers.lock().unwrap();
        for n in names {
            speakers.push_back(n.to_string());
        }
    }

    pub fn push_evaluation(&self, json: &str) {
        self.evaluations.lock().unwrap().push_back(json.into());
    }

    pub fn push_synthesis(&self, text: &str) {
        self.synthesis.lock().unwrap().push_back(text.into());
    }

    pub fn push_agent_reply(&self, agent: &str, reply: Reply) {
        self.agent_replies
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn saw_prompt_containing(&self, needle: &str) -> bool {
        self.seen_prompts
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.contains(needle))
    }
}

#[async_trait]
impl ChatModel for PlaybookModel {
    async fn generate(
        &self,
        messages: &[Message],
        _options: &GenerateOptions,
    ) -> Result<ModelReply, ModelError> {
        let flat: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.seen_prompts.lock().unwrap().push(flat);

        // Single-message prompts are orchestrator internals, recognized by
        // their markers.
        if messages.len() == 1 && messages[0].role == Role::User {
            let text = &messages[0].content;
            if text.contains("Determine which agent should respond next") {
                let name = self
                    .speakers
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| "Coordinator".into());
                return Ok(ModelReply::Final(name));
            }
            if text.contains("RESPOND IN JSON FORMAT") {
                let json = self.evaluations.lock().unwrap().pop_front().unwrap_or_else(
                    || r#"{"is_complete": true, "missing_info": "", "suggested_agents": [], "follow_up_questions": [], "reasoning": "default"}"#.into(),
                );
                return Ok(ModelReply::Final(json));
            }
            if text.contains("Synthesize the specialist responses") {
                let answer = self
                    .synthesis
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| "Here is the combined answer to your question.".into());
                return Ok(ModelReply::Final(answer));
            }
            if text.contains("produce a short routing strategy") {
                return Ok(ModelReply::Final(self.strategy.clone()));
            }
        }

        // Anything else is an agent answering; dispatch on the instruction
        // prefix.
        let agent = messages
            .iter()
            .find(|m| m.role == Role::System)
            .and_then(|m| m.content.lines().next())
            .and_then(|line| line.strip_prefix("agent:"))
            .map(str::to_string);
        let reply = agent.and_then(|name| {
            self.agent_replies
                .lock()
                .unwrap()
                .get_mut(&name)
                .and_then(|q| q.pop_front())
        });
        match reply {
            Some(Reply::Final(text)) => Ok(ModelReply::Final(text)),
            Some(Reply::ToolCalls(calls)) => Ok(ModelReply::ToolCalls(calls)),
            Some(Reply::Stall) => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(ModelReply::Final(String::new()))
            }
            None => Ok(ModelReply::Final(
                "I have nothing further to add to this conversation.".into(),
            )),
        }
    }
}

/// Tool transport double that records every call with its context.
pub struct RecordingTransport {
    pub specs: Vec<ToolSpec>,
    pub results: HashMap<String, Value>,
    pub calls: Mutex<Vec<(String, Value, InvocationContext)>>,
}

impl RecordingTransport {
    pub fn new(tools: &[(&str, Value)]) -> Arc<Self> {
        Arc::new(Self {
            specs: tools
                .iter()
                .map(|(name, _)| ToolSpec {
                    name: name.to_string(),
                    description: format!("test tool {name}"),
                    params: vec![],
                    output: String::new(),
                })
                .collect(),
            results: tools
                .iter()
                .map(|(name, result)| (name.to_string(), result.clone()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded(&self) -> Vec<(String, Value, InvocationContext)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolTransport for RecordingTransport {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        Ok(self.specs.clone())
    }

    async fn call(
        &self,
        tool_name: &str,
        arguments: &Value,
        context: &InvocationContext,
        _deadline: Duration,
    ) -> Result<Value, TransportError> {
        self.calls.lock().unwrap().push((
            tool_name.to_string(),
            arguments.clone(),
            context.clone(),
        ));
        match self.results.get(tool_name) {
            Some(result) => Ok(result.clone()),
            None => Err(TransportError::Tool {
                kind: "not-found".into(),
                message: format!("unknown tool {tool_name}"),
            }),
        }
    }
}

/// In-memory persistence keyed by session id.
#[derive(Default)]
pub struct MapPersistence {
    pub map: Mutex<HashMap<String, String>>,
}

impl MapPersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, session_id: &str, serialized: &str) {
        self.map
            .lock()
            .unwrap()
            .insert(session_id.to_string(), serialized.to_string());
    }
}

#[async_trait]
impl HistoryPersistence for MapPersistence {
    async fn read(&self, session_id: &str, _user_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(session_id).cloned())
    }

    async fn write(
        &self,
        session_id: &str,
        _user_id: &str,
        serialized: &str,
    ) -> anyhow::Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(session_id.to_string(), serialized.to_string());
        Ok(())
    }
}
