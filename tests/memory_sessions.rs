//! Session memory against the file-backed JSONL store: round-trips,
//! truncation invariants, and token-budget enforcement.

use std::sync::Arc;

use tempfile::TempDir;

use roundtable::memory::{JsonlHistoryStore, MemoryStore};
use roundtable::message::{Message, Role};
use roundtable::tokens::{self, TokenBudget};

fn file_store(dir: &TempDir, budget: TokenBudget, max_messages: usize) -> MemoryStore {
    MemoryStore::new(
        Arc::new(JsonlHistoryStore::new(dir.path())),
        budget,
        max_messages,
        "You are a helpful assistant.",
    )
}

#[tokio::test]
async fn history_round_trips_through_files() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir, TokenBudget::default(), 50);

    store.load("s1", "u1").await;
    store
        .append("s1", Message::user("first question"))
        .await
        .unwrap();
    store
        .append(
            "s1",
            Message::named(Role::Assistant, "Coordinator", "first answer"),
        )
        .await
        .unwrap();
    store.save("s1", "u1").await;

    // A fresh store over the same directory sees identical content.
    let reopened = file_store(&dir, TokenBudget::default(), 50);
    let history = reopened.load("s1", "u1").await;
    assert_eq!(history.len(), 3);
    assert_eq!(history.messages()[1].content, "first question");
    assert_eq!(history.messages()[2].name.as_deref(), Some("Coordinator"));
    assert_eq!(history.messages()[2].content, "first answer");
}

#[tokio::test]
async fn sessions_are_isolated_per_user_and_session() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir, TokenBudget::default(), 50);

    store.load("s1", "u1").await;
    store.load("s2", "u1").await;
    store.append("s1", Message::user("only in s1")).await.unwrap();
    store.append("s2", Message::user("only in s2")).await.unwrap();
    store.save("s1", "u1").await;
    store.save("s2", "u1").await;

    let reopened = file_store(&dir, TokenBudget::default(), 50);
    let s1 = reopened.load("s1", "u1").await;
    let s2 = reopened.load("s2", "u1").await;
    assert!(s1.iter().any(|m| m.content == "only in s1"));
    assert!(!s1.iter().any(|m| m.content == "only in s2"));
    assert!(s2.iter().any(|m| m.content == "only in s2"));
}

#[tokio::test]
async fn appends_never_exceed_model_context() {
    let budget = TokenBudget {
        model_context: 4_000,
        safety_reserve: 200,
        response_reserve: 200,
        prompt_overhead: 100,
    };
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir, budget, 500);
    store.load("s1", "u1").await;

    let long = "sentence ".repeat(300);
    for _ in 0..25 {
        store.append("s1", Message::user(long.clone())).await.unwrap();
        let history = store.history("s1").await.unwrap();
        let total = tokens::count_messages(history.messages()).padded();
        assert!(
            total <= budget.model_context,
            "history exceeded model context: {total}"
        );
    }
}

#[tokio::test]
async fn truncation_never_drops_system_messages() {
    let budget = TokenBudget {
        model_context: 3_000,
        safety_reserve: 100,
        response_reserve: 100,
        prompt_overhead: 100,
    };
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir, budget, 8);
    store.load("s1", "u1").await;

    for i in 0..60 {
        store
            .append("s1", Message::user(format!("message number {i} with some padding text")))
            .await
            .unwrap();
    }
    let history = store.history("s1").await.unwrap();
    assert_eq!(history.system_count(), 1);
    assert_eq!(
        history.messages()[0].content,
        "You are a helpful assistant."
    );
    // The newest message always survives.
    assert_eq!(history.last().unwrap().content, "message number 59 with some padding text");
}

#[tokio::test]
async fn summary_reflects_recent_conversation() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir, TokenBudget::default(), 50);
    store.load("s1", "u1").await;
    store
        .append("s1", Message::user("tell me about the sales table"))
        .await
        .unwrap();
    store
        .append(
            "s1",
            Message::named(Role::Assistant, "DbSpecialist", "it has 42 rows"),
        )
        .await
        .unwrap();

    let digest = store.summary("s1", 400).await;
    assert!(digest.contains("sales table"));
    assert!(digest.contains("DbSpecialist"));
    assert!(!digest.contains("helpful assistant")); // system excluded
}
