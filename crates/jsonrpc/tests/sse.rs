//! Loopback tests for the SSE transport against a minimal in-test server
//! speaking the same wire dialect (endpoint event + message POSTs).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone, Default)]
struct TestServer {
    sessions: Arc<RwLock<HashMap<String, mpsc::Sender<Value>>>>,
    next_session: Arc<std::sync::atomic::AtomicU64>,
}

async fn sse_handler(
    State(state): State<TestServer>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let id = state
        .next_session
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        .to_string();
    let (tx, rx) = mpsc::channel::<Value>(16);
    state.sessions.write().await.insert(id.clone(), tx);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={id}"));
    let stream = futures_util::stream::once(async move { Ok(endpoint) }).chain(
        ReceiverStream::new(rx).map(|msg| Ok(Event::default().event("message").data(msg.to_string()))),
    );
    Sse::new(stream)
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: String,
}

async fn message_handler(
    State(state): State<TestServer>,
    Query(MessageQuery { session_id }): Query<MessageQuery>,
    Json(message): Json<Value>,
) -> StatusCode {
    let method = message.get("method").and_then(|m| m.as_str()).unwrap_or("");

    if method == "test/http-fail" {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    if method == "test/close" {
        state.sessions.write().await.remove(&session_id);
        return StatusCode::ACCEPTED;
    }

    let Some(tx) = state.sessions.read().await.get(&session_id).cloned() else {
        return StatusCode::NOT_FOUND;
    };
    if let Some(id) = message.get("id").cloned() {
        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "echo": message.get("params").cloned().unwrap_or(Value::Null) },
        });
        let _ = tx.send(response).await;
    }
    StatusCode::ACCEPTED
}

async fn spawn_test_server() -> (String, tokio::task::JoinHandle<()>) {
    let state = TestServer::default();
    let app = Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://127.0.0.1:{port}/sse"), task)
}

#[tokio::test]
async fn request_round_trips_over_sse() {
    let (url, server) = spawn_test_server().await;

    let client = mcpd_jsonrpc::Client::connect_sse(&url).await.unwrap();
    let result = client
        .request("test/echo", Some(serde_json::json!({ "x": 1 })))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({ "echo": { "x": 1 } }));

    server.abort();
}

#[tokio::test]
async fn failed_post_fails_only_that_request() {
    let (url, server) = spawn_test_server().await;

    let client = mcpd_jsonrpc::Client::connect_sse(&url).await.unwrap();
    let err = client
        .request("test/http-fail", None)
        .await
        .expect_err("http 500 should fail the request");
    match err {
        mcpd_jsonrpc::Error::Rpc { code, message, .. } => {
            assert_eq!(code, -32000);
            assert!(message.contains("http error"), "message={message}");
        }
        other => panic!("unexpected error: {other}"),
    }

    // The SSE stream is still up; a later request succeeds.
    let result = client.request("test/echo", None).await.unwrap();
    assert_eq!(result, serde_json::json!({ "echo": null }));

    server.abort();
}

#[tokio::test]
async fn server_dropping_session_closes_client() {
    let (url, server) = spawn_test_server().await;

    let client = mcpd_jsonrpc::Client::connect_sse(&url).await.unwrap();
    let handle = client.handle();
    let _ = client.notify("test/close", None).await;

    tokio::time::timeout(Duration::from_secs(2), handle.closed())
        .await
        .expect("client observes sse stream end");
    assert!(handle.is_closed());

    server.abort();
}

#[tokio::test]
async fn connect_fails_fast_on_non_sse_endpoint() {
    // Plain 404 server: no /sse route.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, Router::new()).await;
    });

    let err = mcpd_jsonrpc::Client::connect_sse(&format!("http://127.0.0.1:{port}/sse"))
        .await
        .expect_err("connect should fail");
    assert!(err.to_string().contains("sse connect failed"), "err={err}");

    server.abort();
}
