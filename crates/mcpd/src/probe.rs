//! Liveness and process probes.
//!
//! Two concerns live here: asking "is this URL answering?" without getting
//! stuck on an SSE body, and recovering the PID of a process that is already
//! bound to a service's port (a backend started outside the supervisor).

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;

/// Default per-attempt budget for a single readiness request.
pub const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client tuned for probing: no proxy, no redirects, bounded connects.
pub fn probe_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(PROBE_REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Issues a GET and reads only the response status. The response body is
/// dropped immediately, which aborts the connection; an SSE endpoint that
/// streams forever therefore cannot hang the probe.
pub async fn is_reachable(http: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    let send = http.get(url).send();
    match tokio::time::timeout(timeout, send).await {
        Ok(Ok(resp)) => resp.status().is_success(),
        Ok(Err(_)) | Err(_) => false,
    }
}

/// Signal-0 liveness check for a PID.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
pub fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: i32) {}

/// Port of an http(s) URL, including scheme defaults.
pub fn url_port(url: &str) -> Option<u16> {
    reqwest::Url::parse(url).ok()?.port_or_known_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProcess {
    pub pid: u32,
    pub command: String,
}

/// Lists processes listening on a local TCP port. A trait so tests (and
/// other operating systems) can slot in their own implementation; the
/// default Unix one shells out to `lsof`.
#[async_trait]
pub trait PortProber: Send + Sync {
    async fn listeners_on(&self, port: u16) -> anyhow::Result<Vec<PortProcess>>;
}

pub struct LsofProber;

#[async_trait]
impl PortProber for LsofProber {
    async fn listeners_on(&self, port: u16) -> anyhow::Result<Vec<PortProcess>> {
        let output = Command::new("lsof")
            .arg("-nP")
            .arg(format!("-iTCP:{port}"))
            .arg("-sTCP:LISTEN")
            .arg("-Fpc")
            .stdin(Stdio::null())
            .output()
            .await
            .context("run lsof")?;

        // lsof exits non-zero when nothing matches; that is just "no
        // listeners", not an error.
        if !output.status.success() && output.stdout.is_empty() {
            return Ok(Vec::new());
        }
        Ok(parse_lsof_field_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// Parses `lsof -F p c` output: `p<pid>` lines start a process record,
/// `c<command>` lines name its executable.
fn parse_lsof_field_output(text: &str) -> Vec<PortProcess> {
    let mut out: Vec<PortProcess> = Vec::new();
    let mut pid: Option<u32> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix('p') {
            pid = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix('c') {
            if let Some(pid) = pid.take() {
                out.push(PortProcess {
                    pid,
                    command: rest.trim().to_string(),
                });
            }
        }
    }
    out
}

/// Picks the PID to adopt for an externally-started service. With no hints,
/// any listener qualifies. With hints, the listener's command must contain
/// one of them; if none does, no PID is recorded. Tracking nothing beats
/// tracking someone else's process.
pub fn match_listener(listeners: &[PortProcess], hints: &[String]) -> Option<u32> {
    if hints.is_empty() {
        return listeners.first().map(|l| l.pid);
    }
    listeners
        .iter()
        .find(|listener| {
            hints
                .iter()
                .any(|hint| !hint.is_empty() && listener.command.contains(hint.as_str()))
        })
        .map(|l| l.pid)
}
