//! Tool mediation: the uniform contract for invoking external tools on
//! behalf of agents.
//!
//! Every invocation flows through [`ToolMediator::invoke`], which enforces
//! the invoking agent's allowlist, normalizes arguments, propagates the
//! per-request identity out-of-band, and emits start/finish activity
//! events. Failures come back as structured [`ToolResult`] errors — the
//! mediator itself never panics a turn.

pub mod endpoint;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::activity::{ActivityEvent, ActivityStatus, ActivityStreamer};
use crate::message::{ToolCall, ToolFailure, ToolResult};
use crate::registry::AgentRegistry;
use crate::utils::truncate_str;

/// Deadline for retiring an old binding before it is abandoned.
const RETIRE_DEADLINE: Duration = Duration::from_secs(5);

/// Jitter ceiling for the single transport retry.
const RETRY_JITTER_MS: u64 = 150;

// ---------------------------------------------------------------------------
// Tool specifications
// ---------------------------------------------------------------------------

/// One named, typed parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    /// JSON-schema type name ("string", "number", "boolean", ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// Description of a tool discovered from the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<ToolParam>,
    /// Free-form output contract.
    #[serde(default)]
    pub output: String,
}

impl ToolSpec {
    /// JSON-Schema object for function-calling definitions.
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.params {
            properties.insert(
                p.name.clone(),
                serde_json::json!({ "type": p.kind, "description": p.description }),
            );
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Function definition for the chat model.
    pub fn function_def(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.input_schema(),
        })
    }
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Immutable per-request identity, passed by value through every call that
/// may invoke tools. Never stored on long-lived objects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InvocationContext {
    pub user_id: String,
    pub session_id: String,
    /// Optional downstream credential, propagated as a bearer token.
    pub access_token: Option<String>,
}

impl InvocationContext {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Failure from the transport layer, classified for retry.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Network-level failure; retried once with jitter.
    Transport(String),
    /// The tool returned a structured error; surfaced, never retried.
    Tool { kind: String, message: String },
    /// The per-call deadline elapsed.
    Timeout,
}

/// Protocol-level access to the external tool service.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Discover the tools the endpoint offers.
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>>;

    /// Invoke one tool with the given deadline. Context travels out-of-band
    /// (headers or equivalent), never inside `arguments`.
    async fn call(
        &self,
        tool_name: &str,
        arguments: &Value,
        context: &InvocationContext,
        deadline: Duration,
    ) -> Result<Value, TransportError>;

    /// Release transport-side state for a retired binding. Stateless
    /// transports need not override this.
    async fn retire(&self, _binding: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mediator
// ---------------------------------------------------------------------------

struct AgentBinding {
    handle: u64,
    context: InvocationContext,
}

/// Uniform tool invocation for all agents.
pub struct ToolMediator {
    transport: Arc<dyn ToolTransport>,
    registry: Arc<AgentRegistry>,
    streamer: Arc<ActivityStreamer>,
    bindings: Mutex<HashMap<String, Arc<Mutex<AgentBinding>>>>,
    next_handle: AtomicU64,
    request_timeout: Duration,
    timeout_overrides: HashMap<String, Duration>,
}

impl ToolMediator {
    pub fn new(
        transport: Arc<dyn ToolTransport>,
        registry: Arc<AgentRegistry>,
        streamer: Arc<ActivityStreamer>,
        request_timeout: Duration,
        timeout_overrides: HashMap<String, Duration>,
    ) -> Self {
        Self {
            transport,
            registry,
            streamer,
            bindings: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            request_timeout,
            timeout_overrides,
        }
    }

    /// The tools an agent may use: endpoint catalogue filtered by the
    /// agent's allowlist.
    pub async fn tools_for(&self, agent_id: &str) -> anyhow::Result<Vec<ToolSpec>> {
        let Some(descriptor) = self.registry.get(agent_id) else {
            return Ok(Vec::new());
        };
        let all = self.transport.list_tools().await?;
        Ok(all
            .into_iter()
            .filter(|spec| descriptor.allows_tool(&spec.name))
            .collect())
    }

    /// Invoke a tool on behalf of an agent.
    ///
    /// Always returns a [`ToolResult`]; failures are carried in its `error`
    /// field so the conversation can continue and recovery can see them.
    pub async fn invoke(
        &self,
        agent_id: &str,
        call: &ToolCall,
        context: &InvocationContext,
        cancel: &CancellationToken,
    ) -> ToolResult {
        self.streamer.publish(ActivityEvent::new(
            &context.session_id,
            agent_id,
            format!("invoking {}", call.tool_name),
            ActivityStatus::Starting,
            truncate_str(&call.arguments.to_string(), 200),
        ));

        let outcome = self.invoke_inner(agent_id, call, context, cancel).await;

        let (status, details) = match &outcome {
            Ok(value) => (
                ActivityStatus::Completed,
                truncate_str(&value.to_string(), 200),
            ),
            Err(failure) => (
                ActivityStatus::Error,
                format!("{}: {}", failure.kind, truncate_str(&failure.message, 200)),
            ),
        };
        self.streamer.publish(ActivityEvent::new(
            &context.session_id,
            agent_id,
            format!("invoking {}", call.tool_name),
            status,
            details,
        ));

        match outcome {
            Ok(value) => ToolResult {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                result: value,
                error: None,
            },
            Err(failure) => ToolResult {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                result: Value::Null,
                error: Some(failure),
            },
        }
    }

    async fn invoke_inner(
        &self,
        agent_id: &str,
        call: &ToolCall,
        context: &InvocationContext,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolFailure> {
        // Allowlist enforcement: reject before any transport traffic.
        let allowed = self
            .registry
            .get(agent_id)
            .map(|d| d.allows_tool(&call.tool_name))
            .unwrap_or(false);
        if !allowed {
            warn!(agent = %agent_id, tool = %call.tool_name, "tool not on allowlist");
            return Err(ToolFailure {
                kind: "forbidden-tool".into(),
                message: format!(
                    "tool '{}' is not permitted for agent '{}'",
                    call.tool_name, agent_id
                ),
            });
        }

        self.ensure_binding(agent_id, context).await;

        let arguments = normalize_arguments(&call.arguments, context);
        let deadline = self
            .timeout_overrides
            .get(&call.tool_name)
            .copied()
            .unwrap_or(self.request_timeout);

        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(ToolFailure {
                    kind: "cancelled".into(),
                    message: "invocation cancelled".into(),
                });
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ToolFailure {
                        kind: "cancelled".into(),
                        message: "invocation cancelled".into(),
                    });
                }
                r = self
                    .transport
                    .call(&call.tool_name, &arguments, context, deadline) => r,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(TransportError::Tool { kind, message }) => {
                    return Err(ToolFailure {
                        kind: if kind.is_empty() { "tool-error".into() } else { kind },
                        message,
                    });
                }
                Err(TransportError::Timeout) => {
                    return Err(ToolFailure {
                        kind: "timeout".into(),
                        message: format!(
                            "tool '{}' exceeded its {}s deadline",
                            call.tool_name,
                            deadline.as_secs()
                        ),
                    });
                }
                Err(TransportError::Transport(msg)) => {
                    if attempt >= 1 {
                        return Err(ToolFailure {
                            kind: "tool-transport".into(),
                            message: msg,
                        });
                    }
                    let jitter = Duration::from_millis(crate::utils::now_ms() % RETRY_JITTER_MS);
                    debug!(tool = %call.tool_name, error = %msg,
                        "transport failure, retrying once");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(ToolFailure {
                                kind: "cancelled".into(),
                                message: "invocation cancelled".into(),
                            });
                        }
                        _ = tokio::time::sleep(jitter) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Rebuild the agent's binding when the context changed since its last
    /// invocation. The old binding retires asynchronously and never blocks
    /// the new invocation.
    async fn ensure_binding(&self, agent_id: &str, context: &InvocationContext) {
        let slot = {
            let mut bindings = self.bindings.lock().await;
            match bindings.get(agent_id) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                    debug!(agent = %agent_id, handle, "created tool binding");
                    let slot = Arc::new(Mutex::new(AgentBinding {
                        handle,
                        context: context.clone(),
                    }));
                    bindings.insert(agent_id.to_string(), Arc::clone(&slot));
                    return;
                }
            }
        };

        let mut binding = slot.lock().await;
        if binding.context == *context {
            return;
        }
        let old_handle = binding.handle;
        binding.handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        binding.context = context.clone();
        debug!(
            agent = %agent_id,
            old_handle,
            new_handle = binding.handle,
            "context changed, tool binding rebuilt"
        );

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            match tokio::time::timeout(RETIRE_DEADLINE, transport.retire(old_handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(handle = old_handle, error = %e, "binding retirement failed"),
                Err(_) => warn!(handle = old_handle, "binding retirement abandoned after 5s"),
            }
        });
    }

    /// The current binding handle for an agent, if one exists.
    pub async fn binding_handle(&self, agent_id: &str) -> Option<u64> {
        let bindings = self.bindings.lock().await;
        match bindings.get(agent_id) {
            Some(slot) => Some(slot.lock().await.handle),
            None => None,
        }
    }
}

/// Normalize a tool argument map:
/// - flatten one level when arguments arrive nested under a single `kwargs`
///   key;
/// - merge the canonical `user_id` / `session_id` keys.
pub fn normalize_arguments(arguments: &Value, context: &InvocationContext) -> Value {
    let mut map = match arguments {
        Value::Object(obj) => {
            if obj.len() == 1 {
                match obj.get("kwargs") {
                    Some(Value::Object(inner)) => inner.clone(),
                    _ => obj.clone(),
                }
            } else {
                obj.clone()
            }
        }
        Value::Null => serde_json::Map::new(),
        other => {
            let mut m = serde_json::Map::new();
            m.insert("value".into(), other.clone());
            m
        }
    };
    map.insert("user_id".into(), Value::String(context.user_id.clone()));
    map.insert(
        "session_id".into(),
        Value::String(context.session_id.clone()),
    );
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentDescriptor, HealthState};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn registry_with_agent(tools: &[&str]) -> Arc<AgentRegistry> {
        let registry = AgentRegistry::new();
        registry.register(AgentDescriptor {
            agent_id: "db".into(),
            display_name: "DbSpecialist".into(),
            description: "db".into(),
            domains: vec![],
            keywords: vec![],
            examples: vec![],
            tools: tools.iter().map(|s| s.to_string()).collect(),
            routing_weight: 1.0,
            health: HealthState::Healthy,
            coordinator: false,
        });
        Arc::new(registry)
    }

    /// Transport that records calls and replies from a script.
    struct ScriptTransport {
        calls: StdMutex<Vec<(String, Value)>>,
        retired: StdMutex<Vec<u64>>,
        fail_first: StdMutex<usize>,
    }

    impl ScriptTransport {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                retired: StdMutex::new(Vec::new()),
                fail_first: StdMutex::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl ToolTransport for ScriptTransport {
        async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
            Ok(vec![
                ToolSpec {
                    name: "list_databases".into(),
                    description: "lists databases".into(),
                    params: vec![],
                    output: "array".into(),
                },
                ToolSpec {
                    name: "drop_everything".into(),
                    description: "dangerous".into(),
                    params: vec![],
                    output: "".into(),
                },
            ])
        }

        async fn call(
            &self,
            tool_name: &str,
            arguments: &Value,
            _context: &InvocationContext,
            _deadline: Duration,
        ) -> Result<Value, TransportError> {
            {
                let mut fail = self.fail_first.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(TransportError::Transport("connection reset".into()));
                }
            }
            self.calls
                .lock()
                .unwrap()
                .push((tool_name.to_string(), arguments.clone()));
            Ok(json!({"ok": true}))
        }

        async fn retire(&self, binding: u64) -> anyhow::Result<()> {
            self.retired.lock().unwrap().push(binding);
            Ok(())
        }
    }

    fn mediator(transport: Arc<ScriptTransport>, tools: &[&str]) -> ToolMediator {
        ToolMediator::new(
            transport,
            registry_with_agent(tools),
            Arc::new(ActivityStreamer::new(64)),
            Duration::from_secs(30),
            HashMap::new(),
        )
    }

    fn call(tool: &str) -> ToolCall {
        ToolCall {
            call_id: "call-1".into(),
            tool_name: tool.into(),
            arguments: json!({"cluster": "main"}),
        }
    }

    #[tokio::test]
    async fn allowlisted_tool_invokes_and_merges_identity() {
        let transport = ScriptTransport::new(0);
        let mediator = mediator(Arc::clone(&transport), &["list_databases"]);
        let ctx = InvocationContext::new("user-1", "sess-1");

        let result = mediator
            .invoke("db", &call("list_databases"), &ctx, &CancellationToken::new())
            .await;
        assert!(!result.is_error());

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let args = &calls[0].1;
        assert_eq!(args["cluster"], "main");
        assert_eq!(args["user_id"], "user-1");
        assert_eq!(args["session_id"], "sess-1");
    }

    #[tokio::test]
    async fn forbidden_tool_makes_no_transport_call() {
        let transport = ScriptTransport::new(0);
        let mediator = mediator(Arc::clone(&transport), &["list_databases"]);
        let ctx = InvocationContext::new("user-1", "sess-1");

        let result = mediator
            .invoke("db", &call("drop_everything"), &ctx, &CancellationToken::new())
            .await;
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, "forbidden-tool");
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_is_forbidden() {
        let transport = ScriptTransport::new(0);
        let mediator = mediator(Arc::clone(&transport), &["list_databases"]);
        let ctx = InvocationContext::new("user-1", "sess-1");
        let result = mediator
            .invoke("ghost", &call("list_databases"), &ctx, &CancellationToken::new())
            .await;
        assert_eq!(result.error.unwrap().kind, "forbidden-tool");
    }

    #[tokio::test]
    async fn transport_failure_retried_once() {
        let transport = ScriptTransport::new(1);
        let mediator = mediator(Arc::clone(&transport), &["list_databases"]);
        let ctx = InvocationContext::new("u", "s");
        let result = mediator
            .invoke("db", &call("list_databases"), &ctx, &CancellationToken::new())
            .await;
        assert!(!result.is_error());
        assert_eq!(transport.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_transport_failure_surfaces() {
        let transport = ScriptTransport::new(10);
        let mediator = mediator(Arc::clone(&transport), &["list_databases"]);
        let ctx = InvocationContext::new("u", "s");
        let result = mediator
            .invoke("db", &call("list_databases"), &ctx, &CancellationToken::new())
            .await;
        assert_eq!(result.error.unwrap().kind, "tool-transport");
    }

    #[tokio::test]
    async fn context_change_rebuilds_binding_and_retires_old() {
        let transport = ScriptTransport::new(0);
        let mediator = mediator(Arc::clone(&transport), &["list_databases"]);
        let cancel = CancellationToken::new();

        let ctx1 = InvocationContext::new("u1", "s1");
        mediator.invoke("db", &call("list_databases"), &ctx1, &cancel).await;
        let first = mediator.binding_handle("db").await.unwrap();

        // Same context: binding stable.
        mediator.invoke("db", &call("list_databases"), &ctx1, &cancel).await;
        assert_eq!(mediator.binding_handle("db").await.unwrap(), first);

        // New session: binding swapped, old handle retired.
        let ctx2 = InvocationContext::new("u1", "s2");
        mediator.invoke("db", &call("list_databases"), &ctx2, &cancel).await;
        let second = mediator.binding_handle("db").await.unwrap();
        assert_ne!(first, second);

        // Retirement runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*transport.retired.lock().unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn invocation_emits_start_and_finish_events() {
        let transport = ScriptTransport::new(0);
        let streamer = Arc::new(ActivityStreamer::new(64));
        let mediator = ToolMediator::new(
            transport,
            registry_with_agent(&["list_databases"]),
            Arc::clone(&streamer),
            Duration::from_secs(30),
            HashMap::new(),
        );
        let sub = streamer.subscribe("sess-1");
        let ctx = InvocationContext::new("u", "sess-1");
        mediator
            .invoke("db", &call("list_databases"), &ctx, &CancellationToken::new())
            .await;

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, ActivityStatus::Starting);
        assert_eq!(events[1].status, ActivityStatus::Completed);
        assert!(events[0].action.contains("list_databases"));
    }

    #[tokio::test]
    async fn cancellation_produces_cancelled_result() {
        let transport = ScriptTransport::new(0);
        let mediator = mediator(transport, &["list_databases"]);
        let ctx = InvocationContext::new("u", "s");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = mediator.invoke("db", &call("list_databases"), &ctx, &cancel).await;
        assert_eq!(result.error.unwrap().kind, "cancelled");
    }

    #[tokio::test]
    async fn tools_for_filters_by_allowlist() {
        let transport = ScriptTransport::new(0);
        let mediator = mediator(transport, &["list_databases"]);
        let tools = mediator.tools_for("db").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "list_databases");
    }

    #[test]
    fn kwargs_flattened_one_level() {
        let ctx = InvocationContext::new("u", "s");
        let nested = json!({"kwargs": {"table": "sales"}});
        let out = normalize_arguments(&nested, &ctx);
        assert_eq!(out["table"], "sales");
        assert!(out.get("kwargs").is_none());
        assert_eq!(out["user_id"], "u");
    }

    #[test]
    fn non_object_arguments_wrapped() {
        let ctx = InvocationContext::new("u", "s");
        let out = normalize_arguments(&json!("raw"), &ctx);
        assert_eq!(out["value"], "raw");
        assert_eq!(out["session_id"], "s");
    }

    #[test]
    fn input_schema_marks_required_params() {
        let spec = ToolSpec {
            name: "describe_table".into(),
            description: "".into(),
            params: vec![
                ToolParam {
                    name: "table".into(),
                    kind: "string".into(),
                    required: true,
                    description: "table name".into(),
                },
                ToolParam {
                    name: "limit".into(),
                    kind: "number".into(),
                    required: false,
                    description: "".into(),
                },
            ],
            output: "".into(),
        };
        let schema = spec.input_schema();
        assert_eq!(schema["properties"]["table"]["type"], "string");
        assert_eq!(schema["required"], json!(["table"]));
    }
}
