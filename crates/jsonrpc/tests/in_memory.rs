use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpd_jsonrpc::{RpcError, ServerHandler};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn parse_line(line: &str) -> Value {
    serde_json::from_str(line).expect("valid json")
}

#[tokio::test]
async fn request_gets_matching_response() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let client = mcpd_jsonrpc::Client::connect_io(client_read, client_write)
        .await
        .expect("client connect");

    let server = tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let req = parse_line(&line);
        assert_eq!(req["method"], "demo/echo");
        assert_eq!(req["params"]["x"], 1);

        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "result": { "x": 1 },
        });
        let mut out = serde_json::to_vec(&response).unwrap();
        out.push(b'\n');
        server_write.write_all(&out).await.unwrap();
    });

    let result = client
        .request("demo/echo", Some(serde_json::json!({ "x": 1 })))
        .await
        .expect("request ok");
    assert_eq!(result, serde_json::json!({ "x": 1 }));

    server.await.unwrap();
}

#[tokio::test]
async fn error_response_maps_to_rpc_error() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let client = mcpd_jsonrpc::Client::connect_io(client_read, client_write)
        .await
        .expect("client connect");

    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let req = parse_line(&line);
        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "error": { "code": -32601, "message": "method not found: nope" },
        });
        let mut out = serde_json::to_vec(&response).unwrap();
        out.push(b'\n');
        server_write.write_all(&out).await.unwrap();
    });

    let err = client
        .request("nope", None)
        .await
        .expect_err("should be an rpc error");
    match err {
        mcpd_jsonrpc::Error::Rpc { code, message, .. } => {
            assert_eq!(code, -32601);
            assert!(message.contains("nope"), "message={message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn notifications_are_delivered_in_order() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (_server_read, mut server_write) = tokio::io::split(server_stream);

    let mut client = mcpd_jsonrpc::Client::connect_io(client_read, client_write)
        .await
        .expect("client connect");
    let mut notifications = client.take_notifications().expect("notifications channel");

    for i in 0..3 {
        let note = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "demo/tick",
            "params": { "seq": i },
        });
        let mut out = serde_json::to_vec(&note).unwrap();
        out.push(b'\n');
        server_write.write_all(&out).await.unwrap();
    }

    for i in 0..3 {
        let note = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
            .await
            .expect("notification in time")
            .expect("channel open");
        assert_eq!(note.method, "demo/tick");
        assert_eq!(note.params.unwrap()["seq"], i);
    }
}

#[tokio::test]
async fn peer_eof_fails_pending_requests_and_signals_closed() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let client = mcpd_jsonrpc::Client::connect_io(client_read, client_write)
        .await
        .expect("client connect");
    let handle = client.handle();

    let request = tokio::spawn({
        let handle = client.handle();
        async move { handle.request("demo/hang", None).await }
    });

    // Give the request a chance to be written, then drop the peer.
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(server_stream);

    let err = request.await.unwrap().expect_err("request should fail");
    assert!(err.is_closed(), "err={err}");

    tokio::time::timeout(Duration::from_secs(1), handle.closed())
        .await
        .expect("closed() resolves");
    assert!(handle.is_closed());
    assert!(handle.close_reason().unwrap().contains("closed"));
}

#[tokio::test]
async fn request_with_timeout_gives_wait_timeout() {
    let (client_stream, _server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let client = mcpd_jsonrpc::Client::connect_io(client_read, client_write)
        .await
        .expect("client connect");

    let err = client
        .handle()
        .request_with_timeout("demo/hang", None, Duration::from_millis(20))
        .await
        .expect_err("should time out");
    assert!(err.is_wait_timeout(), "err={err}");
}

#[tokio::test]
async fn wait_returns_ok_none_when_client_has_no_child() {
    let (client_stream, _server_stream) = tokio::io::duplex(64);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let mut client = mcpd_jsonrpc::Client::connect_io(client_read, client_write)
        .await
        .expect("client connect");
    let status = client.wait().await.expect("wait ok");
    assert!(status.is_none());
}

struct EchoHandler;

#[async_trait]
impl ServerHandler for EchoHandler {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            "demo/echo" => Ok(params.unwrap_or(Value::Null)),
            "demo/fail" => Err(RpcError::internal("boom")),
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

#[tokio::test]
async fn serve_io_answers_requests_and_skips_notifications() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let (client_read, mut client_write) = tokio::io::split(client_stream);

    let server = tokio::spawn(async move {
        mcpd_jsonrpc::serve_io(server_read, server_write, Arc::new(EchoHandler)).await
    });

    client_write
        .write_all(
            concat!(
                r#"{"jsonrpc":"2.0","method":"demo/note","params":{}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":1,"method":"demo/echo","params":{"a":true}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":2,"method":"demo/fail"}"#,
                "\n",
                r#"not json"#,
                "\n",
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    drop(client_write);

    let mut lines = BufReader::new(client_read).lines();

    let first = parse_line(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(first["id"], 1);
    assert_eq!(first["result"], serde_json::json!({ "a": true }));

    let second = parse_line(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(second["id"], 2);
    assert_eq!(second["error"]["code"], -32603);

    let third = parse_line(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(third["id"], Value::Null);
    assert_eq!(third["error"]["code"], -32700);

    assert!(lines.next_line().await.unwrap().is_none());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn handle_message_ignores_bare_responses() {
    let msg = serde_json::json!({ "jsonrpc": "2.0", "id": 7, "result": {} });
    let out = mcpd_jsonrpc::handle_message(&EchoHandler, msg).await;
    assert!(out.is_none());
}
