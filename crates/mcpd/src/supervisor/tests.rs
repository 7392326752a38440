use super::*;
use crate::config::ReadinessConfig;
use crate::probe::PortProcess;
use crate::state::STATE_FILE_NAME;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

struct NoListeners;

#[async_trait]
impl PortProber for NoListeners {
    async fn listeners_on(&self, _port: u16) -> anyhow::Result<Vec<PortProcess>> {
        Ok(Vec::new())
    }
}

struct ScriptedProber(Vec<PortProcess>);

#[async_trait]
impl PortProber for ScriptedProber {
    async fn listeners_on(&self, _port: u16) -> anyhow::Result<Vec<PortProcess>> {
        Ok(self.0.clone())
    }
}

fn supervisor(dir: &std::path::Path, prober: Box<dyn PortProber>) -> Supervisor {
    Supervisor::new(StateStore::in_dir(dir), prober)
}

fn stdio_cfg(command: &str, args: &[&str]) -> ServiceConfig {
    ServiceConfig {
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        transport: Transport::Stdio,
        url: None,
        cwd: None,
        env: Default::default(),
        readiness: ReadinessConfig::default(),
        restart: RestartPolicy::Never,
        keep_alive: true,
        exclude_tools: Default::default(),
        response_middleware: Vec::new(),
    }
}

fn sse_cfg(command: &str, url: &str, timeout: Duration, interval: Duration) -> ServiceConfig {
    ServiceConfig {
        command: command.to_string(),
        args: Vec::new(),
        transport: Transport::Sse,
        url: Some(url.to_string()),
        cwd: None,
        env: Default::default(),
        readiness: ReadinessConfig {
            url: None,
            timeout,
            interval,
        },
        restart: RestartPolicy::Never,
        keep_alive: true,
        exclude_tools: Default::default(),
        response_middleware: Vec::new(),
    }
}

/// Serves plain `HTTP 200` on an OS-assigned port, forever.
async fn ok_http_listener() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    (format!("http://127.0.0.1:{port}/"), task)
}

#[tokio::test]
async fn readiness_timeout_sets_error_state() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), Box::new(NoListeners));

    // Port 1 never answers.
    let mut cfg = sse_cfg(
        "sleep",
        "http://127.0.0.1:1/",
        Duration::from_millis(500),
        Duration::from_millis(100),
    );
    cfg.args = vec!["30".to_string()];

    let err = sup.start("svc", &cfg).await.unwrap_err();
    assert!(format!("{err:#}").contains("timed out"), "err={err:#}");

    let status = sup.state("svc").await.unwrap();
    assert_eq!(status.state, ServiceState::Error);

    // The orphan was stopped, not leaked.
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn stdio_service_is_ready_immediately_and_stop_kills_it() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), Box::new(NoListeners));

    sup.start("svc", &stdio_cfg("sleep", &["30"])).await.unwrap();
    let status = sup.state("svc").await.unwrap();
    assert_eq!(status.state, ServiceState::Ready);
    let pid = status.pid.expect("spawned pid");
    assert!(pid_alive(pid));

    sup.stop("svc").await.unwrap();
    let status = sup.state("svc").await.unwrap();
    assert_eq!(status.state, ServiceState::Stopped);
    assert!(status.pid.is_none());

    // SIGTERM took effect within the grace period.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn stop_unknown_service_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), Box::new(NoListeners));
    sup.stop("ghost").await.unwrap();
    assert!(sup.state("ghost").await.is_none());
}

#[tokio::test]
async fn reuse_adopts_persisted_live_pid_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let (url, server) = ok_http_listener().await;

    // A prior instance recorded our own (alive) pid.
    let store = StateStore::in_dir(dir.path());
    let mut map = StateMap::new();
    map.insert(
        "svc".to_string(),
        ServiceStatus {
            state: ServiceState::Ready,
            pid: Some(std::process::id()),
            url: Some(url.clone()),
        },
    );
    store.save(&map).await.unwrap();

    let sup = supervisor(dir.path(), Box::new(NoListeners));
    // The command does not exist; a spawn attempt would fail loudly.
    let cfg = sse_cfg(
        "/nonexistent/mcpd-test-binary",
        &url,
        Duration::from_secs(1),
        Duration::from_millis(100),
    );
    sup.start("svc", &cfg).await.unwrap();

    let status = sup.state("svc").await.unwrap();
    assert_eq!(status.state, ServiceState::Ready);
    assert_eq!(status.pid, Some(std::process::id()));

    server.abort();
}

#[tokio::test]
async fn external_service_gets_pid_recovered_with_matching_hint() {
    let dir = tempfile::tempdir().unwrap();
    let (url, server) = ok_http_listener().await;

    let sup = supervisor(
        dir.path(),
        Box::new(ScriptedProber(vec![PortProcess {
            pid: 7777,
            command: "mock-server".to_string(),
        }])),
    );
    let cfg = sse_cfg(
        "/usr/local/bin/mock-server",
        &url,
        Duration::from_secs(1),
        Duration::from_millis(100),
    );
    sup.start("svc", &cfg).await.unwrap();

    let status = sup.state("svc").await.unwrap();
    assert_eq!(status.state, ServiceState::Ready);
    assert_eq!(status.pid, Some(7777));

    server.abort();
}

#[tokio::test]
async fn external_pid_recovery_fails_closed_on_hint_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let (url, server) = ok_http_listener().await;

    let sup = supervisor(
        dir.path(),
        Box::new(ScriptedProber(vec![PortProcess {
            pid: 7777,
            command: "postgres".to_string(),
        }])),
    );
    let cfg = sse_cfg(
        "/usr/local/bin/mock-server",
        &url,
        Duration::from_secs(1),
        Duration::from_millis(100),
    );
    sup.start("svc", &cfg).await.unwrap();

    let status = sup.state("svc").await.unwrap();
    assert_eq!(status.state, ServiceState::Ready);
    assert_eq!(status.pid, None);

    server.abort();
}

#[tokio::test]
async fn start_all_rolls_back_started_services_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), Box::new(NoListeners));

    let good = stdio_cfg("sleep", &["30"]);
    let bad = sse_cfg(
        "sleep",
        "http://127.0.0.1:1/",
        Duration::from_millis(300),
        Duration::from_millis(100),
    );

    let err = sup
        .start_all(&[
            ("good".to_string(), good),
            ("bad".to_string(), bad),
        ])
        .await
        .unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("bad"), "err={msg}");
    assert!(msg.contains("timed out"), "err={msg}");

    // The service that did start was rolled back.
    let status = sup.state("good").await.unwrap();
    assert_eq!(status.state, ServiceState::Stopped);
}

#[tokio::test]
async fn crash_while_ready_records_error() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), Box::new(NoListeners));

    // Ready immediately (stdio), then the process exits on its own.
    sup.start("svc", &stdio_cfg("true", &[])).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let status = sup.state("svc").await.unwrap();
        if status.state == ServiceState::Error {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "state never became error: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn register_pid_marks_ready_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), Box::new(NoListeners));

    let cfg = stdio_cfg("server", &[]);
    sup.register_pid("svc", &cfg, 1234).await.unwrap();

    let status = sup.state("svc").await.unwrap();
    assert_eq!(status.state, ServiceState::Ready);
    assert_eq!(status.pid, Some(1234));

    let persisted: StateMap = serde_json::from_slice(
        &tokio::fs::read(dir.path().join(STATE_FILE_NAME)).await.unwrap(),
    )
    .unwrap();
    assert_eq!(persisted["svc"].pid, Some(1234));
}

#[test]
fn command_hints_use_basename_and_plain_args() {
    let mut cfg = stdio_cfg("/opt/bin/serena-mcp", &[]);
    cfg.args = vec!["--port".to_string(), "serve".to_string()];
    let hints = command_hints(&cfg);
    assert_eq!(hints, vec!["serena-mcp".to_string(), "serve".to_string()]);
}
