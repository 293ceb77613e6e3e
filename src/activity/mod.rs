//! Per-session activity streaming.
//!
//! Subscribers register per session id and receive progress events in
//! publish order. Publishing never blocks: each sink owns a bounded buffer
//! with drop-oldest overflow, and a run of drops is coalesced into a single
//! synthetic `dropped=N` event delivered before newer events.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::utils::now_ms;

/// Event status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityStatus {
    Starting,
    InProgress,
    Completed,
    Error,
}

/// A progress record broadcast to session subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub session_id: String,
    pub agent_name: String,
    /// Short label (e.g. "invoking list_databases").
    pub action: String,
    pub status: ActivityStatus,
    pub details: String,
    pub event_id: String,
    /// Unix-epoch milliseconds.
    pub timestamp: u64,
}

impl ActivityEvent {
    pub fn new(
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        action: impl Into<String>,
        status: ActivityStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            action: action.into(),
            status,
            details: details.into(),
            event_id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
        }
    }
}

/// Placeholder actions filtered at publish time to reduce UI noise.
const GENERIC_ACTIONS: &[&str] = &["analyzing request"];

/// Result sentinels that indicate a non-answer; filtered at publish time.
const CANNOT_ANSWER_SENTINELS: &[&str] = &["i cannot answer", "cannot answer that"];

fn should_filter(event: &ActivityEvent) -> bool {
    let action = event.action.to_lowercase();
    if GENERIC_ACTIONS.iter().any(|g| action.starts_with(g)) {
        return true;
    }
    let details = event.details.to_lowercase();
    CANNOT_ANSWER_SENTINELS.iter().any(|s| details.contains(s))
}

// ---------------------------------------------------------------------------
// Sinks and subscriptions
// ---------------------------------------------------------------------------

struct SinkShared {
    session_id: String,
    buf: Mutex<VecDeque<ActivityEvent>>,
    dropped: AtomicUsize,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    id: u64,
}

impl SinkShared {
    fn offer(&self, event: ActivityEvent) {
        let mut buf = self.buf.lock().expect("sink buffer poisoned");
        if buf.len() >= self.capacity {
            buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }

    fn take(&self) -> Option<ActivityEvent> {
        // A run of drops is reported once, before anything newer.
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            return Some(ActivityEvent::new(
                self.session_id.clone(),
                "activity-streamer",
                "dropped",
                ActivityStatus::Completed,
                format!("dropped={dropped}"),
            ));
        }
        self.buf.lock().expect("sink buffer poisoned").pop_front()
    }
}

/// A live subscription to one session's activity events.
///
/// Dropping the subscription detaches it from the streamer.
pub struct Subscription {
    shared: Arc<SinkShared>,
}

impl Subscription {
    /// Receive the next event, waiting if the buffer is empty.
    pub async fn recv(&self) -> ActivityEvent {
        loop {
            if let Some(event) = self.shared.take() {
                return event;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&self) -> Option<ActivityEvent> {
        self.shared.take()
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<ActivityEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// ActivityStreamer
// ---------------------------------------------------------------------------

/// Fan-out of [`ActivityEvent`]s keyed by session id.
pub struct ActivityStreamer {
    sinks: Mutex<HashMap<String, Vec<Arc<SinkShared>>>>,
    buffer: usize,
    next_id: AtomicU64,
}

impl ActivityStreamer {
    pub fn new(buffer: usize) -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a session's events.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let shared = Arc::new(SinkShared {
            session_id: session_id.to_string(),
            buf: Mutex::new(VecDeque::new()),
            dropped: AtomicUsize::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.buffer,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        });
        self.sinks
            .lock()
            .expect("sink registry poisoned")
            .entry(session_id.to_string())
            .or_default()
            .push(Arc::clone(&shared));
        Subscription { shared }
    }

    /// Detach a subscription explicitly.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut sinks = self.sinks.lock().expect("sink registry poisoned");
        if let Some(list) = sinks.get_mut(subscription.session_id()) {
            list.retain(|s| s.id != subscription.shared.id);
            if list.is_empty() {
                sinks.remove(subscription.session_id());
            }
        }
        subscription.shared.closed.store(true, Ordering::Relaxed);
    }

    /// Publish an event to every subscriber of its session.
    ///
    /// Non-blocking: a slow sink loses its oldest buffered events rather
    /// than back-pressuring the caller.
    pub fn publish(&self, event: ActivityEvent) {
        if should_filter(&event) {
            return;
        }
        let mut sinks = self.sinks.lock().expect("sink registry poisoned");
        let Some(list) = sinks.get_mut(&event.session_id) else {
            return;
        };
        list.retain(|s| !s.closed.load(Ordering::Relaxed));
        for sink in list.iter() {
            sink.offer(event.clone());
        }
        if list.is_empty() {
            sinks.remove(&event.session_id);
        }
    }

    /// Number of live subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sinks
            .lock()
            .expect("sink registry poisoned")
            .get(session_id)
            .map(|l| {
                l.iter()
                    .filter(|s| !s.closed.load(Ordering::Relaxed))
                    .count()
            })
            .unwrap_or(0)
    }
}
