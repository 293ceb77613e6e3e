//! OpenAI-compatible chat client against a mock HTTP server: plain
//! replies, tool-call replies, and retry behavior through `ModelClient`.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use roundtable::message::Message;
use roundtable::models::{
    ChatModel, GenerateOptions, ModelClient, ModelReply, OpenAICompatModel,
};

fn client(server: &MockServer) -> OpenAICompatModel {
    OpenAICompatModel::new(
        format!("{}/v1/chat/completions", server.uri()),
        "test-key".into(),
        "gpt-4o-mini".into(),
    )
}

#[tokio::test]
async fn plain_completion_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "model": "gpt-4o-mini" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "Paris." } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
        })))
        .mount(&server)
        .await;

    let reply = client(&server)
        .generate(
            &[Message::user("capital of France?")],
            &GenerateOptions::plain(0.1, 100),
        )
        .await
        .unwrap();
    assert_eq!(reply, ModelReply::Final("Paris.".into()));
}

#[tokio::test]
async fn tool_calls_are_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "list_databases",
                            "arguments": "{\"cluster\":\"main\"}"
                        }
                    }]
                }
            }]
        })))
        .mount(&server)
        .await;

    let options = GenerateOptions {
        temperature: 0.0,
        max_tokens: 100,
        tools: vec![json!({ "name": "list_databases", "parameters": {} })],
    };
    let reply = client(&server)
        .generate(&[Message::user("list dbs")], &options)
        .await
        .unwrap();
    match reply {
        ModelReply::ToolCalls(calls) => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].tool_name, "list_databases");
            assert_eq!(calls[0].arguments["cluster"], "main");
        }
        other => panic!("expected tool calls, got {other:?}"),
    }
}

/// Responds 500 for the first two requests, then succeeds.
struct FlakyResponder {
    failures: std::sync::Mutex<usize>,
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            ResponseTemplate::new(500).set_body_string("upstream hiccup")
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "recovered" } }]
            }))
        }
    }
}

#[tokio::test]
async fn model_client_retries_transient_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(FlakyResponder {
            failures: std::sync::Mutex::new(2),
        })
        .mount(&server)
        .await;

    let wrapped = ModelClient::new(Arc::new(client(&server)));
    let reply = wrapped
        .generate(
            &[Message::user("hi")],
            &GenerateOptions::plain(0.0, 50),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply, ModelReply::Final("recovered".into()));
}

#[tokio::test]
async fn client_error_is_fatal_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let wrapped = ModelClient::new(Arc::new(client(&server)));
    let err = wrapped
        .generate(
            &[Message::user("hi")],
            &GenerateOptions::plain(0.0, 50),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, roundtable::error::ErrorKind::ModelFatal(_)));
}
