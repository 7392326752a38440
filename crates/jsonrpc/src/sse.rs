//! Classic HTTP+SSE client transport.
//!
//! The server keeps a `GET /sse` response open. Its first event is
//! `endpoint`, whose data names the URL that JSON-RPC payloads are POSTed
//! to (carrying the session id). Subsequent `message` events carry the
//! server's JSON-RPC messages.
//!
//! Internally the transport bridges an in-memory duplex pair: lines the
//! [`Client`] writes become POSTs, SSE `message` events become lines on the
//! client's read side.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use crate::{read_line_limited, Client, ClientHandle, Error, Limits, ProtocolErrorKind};

#[derive(Debug, Clone)]
pub struct SseOptions {
    /// Extra HTTP headers to include on all requests.
    pub headers: HashMap<String, String>,
    /// Timeout for establishing the SSE stream and receiving the `endpoint`
    /// event.
    pub connect_timeout: Duration,
    pub limits: Limits,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
            limits: Limits::default(),
        }
    }
}

impl Client {
    pub async fn connect_sse(url: &str) -> Result<Self, Error> {
        Self::connect_sse_with_options(url, SseOptions::default()).await
    }

    pub async fn connect_sse_with_options(url: &str, options: SseOptions) -> Result<Self, Error> {
        let SseOptions {
            headers,
            connect_timeout,
            limits,
        } = options;

        let base_url = reqwest::Url::parse(url).map_err(|err| {
            Error::protocol(ProtocolErrorKind::InvalidInput, format!("invalid sse url: {err}"))
        })?;

        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name =
                reqwest::header::HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                    Error::protocol(
                        ProtocolErrorKind::InvalidInput,
                        format!("invalid http header name: {key}"),
                    )
                })?;
            let value = reqwest::header::HeaderValue::from_str(&value).map_err(|_| {
                Error::protocol(
                    ProtocolErrorKind::InvalidInput,
                    format!("invalid http header value: {key}"),
                )
            })?;
            header_map.insert(name, value);
        }

        let http_client = reqwest::Client::builder()
            // Avoid automatic proxy environment variable loading by default.
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .default_headers(header_map)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| {
                Error::protocol(
                    ProtocolErrorKind::InvalidInput,
                    format!("build http client failed: {err}"),
                )
            })?;

        let resp = tokio::time::timeout(
            connect_timeout,
            http_client
                .get(base_url.clone())
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| Error::protocol(ProtocolErrorKind::Sse, "sse connect timed out"))?
        .map_err(|err| {
            Error::protocol(ProtocolErrorKind::Sse, format!("sse connect failed: {err}"))
        })?;

        if !resp.status().is_success() {
            return Err(Error::protocol(
                ProtocolErrorKind::Sse,
                format!("sse connect failed: status={}", resp.status()),
            ));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type
            .to_ascii_lowercase()
            .starts_with("text/event-stream")
        {
            return Err(Error::protocol(
                ProtocolErrorKind::Sse,
                format!("sse connect failed: expected content-type text/event-stream, got {content_type}"),
            ));
        }

        let stream = resp.bytes_stream().map_err(io::Error::other);
        let mut reader = tokio::io::BufReader::new(StreamReader::new(stream));

        // The endpoint event must arrive before any request can be sent.
        let endpoint = tokio::time::timeout(
            connect_timeout,
            wait_for_endpoint_event(&mut reader, limits.max_message_bytes),
        )
        .await
        .map_err(|_| Error::protocol(ProtocolErrorKind::Sse, "sse endpoint event timed out"))??;

        let post_url = base_url.join(&endpoint).map_err(|err| {
            Error::protocol(
                ProtocolErrorKind::Sse,
                format!("invalid sse endpoint {endpoint:?}: {err}"),
            )
        })?;

        let (client_stream, bridge_stream) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_stream);

        let mut client =
            Self::connect_io_with_limits(client_read, client_write, limits.clone()).await?;
        let handle = client.handle();

        let writer = Arc::new(tokio::sync::Mutex::new(bridge_write));

        let post_task = tokio::spawn(post_bridge(
            bridge_read,
            writer.clone(),
            handle.clone(),
            http_client,
            post_url,
            limits.clone(),
        ));
        let sse_task = tokio::spawn(sse_pump(reader, writer, handle, limits));

        client.push_transport_task(post_task);
        client.push_transport_task(sse_task);
        Ok(client)
    }
}

/// One parsed SSE event: (event name, joined data lines).
async fn next_event<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> io::Result<Option<(String, String)>> {
    let mut name = String::new();
    let mut data = String::new();

    loop {
        let Some(line) = read_line_limited(reader, max_bytes).await? else {
            return Ok(None);
        };

        if line.is_empty() {
            if data.is_empty() && name.is_empty() {
                continue;
            }
            if name.is_empty() {
                name = "message".to_string();
            }
            return Ok(Some((name, data)));
        }

        // Comment lines start with a colon.
        if line.first() == Some(&b':') {
            continue;
        }

        let (field, rest) = match line.iter().position(|&b| b == b':') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => (&line[..], &[] as &[u8]),
        };
        let rest = match rest.first() {
            Some(b' ') => &rest[1..],
            _ => rest,
        };

        match field {
            b"event" => name = String::from_utf8_lossy(rest).into_owned(),
            b"data" => {
                if !data.is_empty() {
                    data.push('\n');
                }
                if data.len().saturating_add(rest.len()) > max_bytes {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "sse event too large",
                    ));
                }
                data.push_str(&String::from_utf8_lossy(rest));
            }
            _ => {}
        }
    }
}

async fn wait_for_endpoint_event<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<String, Error> {
    loop {
        let event = next_event(reader, max_bytes).await.map_err(|err| {
            Error::protocol(ProtocolErrorKind::Sse, format!("sse stream failed: {err}"))
        })?;
        match event {
            Some((name, data)) if name == "endpoint" => return Ok(data),
            Some(_) => continue,
            None => {
                return Err(Error::protocol(
                    ProtocolErrorKind::Sse,
                    "sse stream closed before endpoint event",
                ))
            }
        }
    }
}

/// Reads lines the client writes and POSTs each to the message endpoint.
async fn post_bridge(
    bridge_read: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    writer: Arc<tokio::sync::Mutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
    handle: ClientHandle,
    http_client: reqwest::Client,
    post_url: reqwest::Url,
    limits: Limits,
) {
    const SSE_TRANSPORT_ERROR: i64 = -32000;

    let mut reader = tokio::io::BufReader::new(bridge_read);
    loop {
        let line = match read_line_limited(&mut reader, limits.max_message_bytes).await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                handle
                    .close_with_reason(format!("sse post bridge failed: {err}"))
                    .await;
                return;
            }
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let id = serde_json::from_slice::<Value>(&line)
            .ok()
            .and_then(|msg| msg.get("id").filter(|id| !id.is_null()).cloned());

        let result = http_client
            .post(post_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(line)
            .send()
            .await;

        let failure = match result {
            Ok(resp) if resp.status().is_success() => None,
            Ok(resp) => Some(format!("http error: {}", resp.status())),
            Err(err) => Some(format!("http request failed: {err}")),
        };

        // A failed POST fails that one request; the SSE stream stays up.
        if let (Some(failure), Some(id)) = (failure, id) {
            let _ = write_error_line(&writer, id, SSE_TRANSPORT_ERROR, failure).await;
        }
    }
}

/// Forwards SSE `message` events to the client as JSON lines.
async fn sse_pump<R: tokio::io::AsyncBufRead + Unpin>(
    mut reader: R,
    writer: Arc<tokio::sync::Mutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
    handle: ClientHandle,
    limits: Limits,
) {
    loop {
        match next_event(&mut reader, limits.max_message_bytes).await {
            Ok(Some((name, data))) => {
                if name != "message" || data.is_empty() {
                    continue;
                }
                let mut writer = writer.lock().await;
                if writer.write_all(data.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    return;
                }
            }
            Ok(None) => {
                handle.close_with_reason("sse stream closed").await;
                let mut writer = writer.lock().await;
                let _ = writer.shutdown().await;
                return;
            }
            Err(err) => {
                handle
                    .close_with_reason(format!("sse stream failed: {err}"))
                    .await;
                let mut writer = writer.lock().await;
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

async fn write_error_line(
    writer: &Arc<tokio::sync::Mutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
    id: Value,
    code: i64,
    message: String,
) -> io::Result<()> {
    let response = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    });
    let mut out = serde_json::to_vec(&response)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    out.push(b'\n');

    let mut writer = writer.lock().await;
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}
