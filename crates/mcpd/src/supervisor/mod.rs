//! Service supervisor: spawn, readiness, restart, stop, cross-instance
//! reuse, crash handling.
//!
//! Every state transition is persisted to the state file, which doubles as
//! the hand-off channel to the next daemon instance (keep-alive services are
//! adopted instead of re-spawned when their recorded PID is alive and their
//! readiness URL answers).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{RestartPolicy, ServiceConfig, Transport};
use crate::probe::{
    is_reachable, match_listener, pid_alive, probe_http_client, send_signal, url_port, PortProber,
    PROBE_REQUEST_TIMEOUT,
};
use crate::state::{ServiceState, ServiceStatus, StateMap, StateStore};

#[cfg(test)]
mod tests;

/// Grace period between SIGTERM and SIGKILL when stopping a child.
const STOP_GRACE: Duration = Duration::from_secs(5);

struct ProcHandle {
    pid: u32,
    exit_rx: watch::Receiver<bool>,
}

struct ServiceEntry {
    config: ServiceConfig,
    status: ServiceStatus,
    proc: Option<ProcHandle>,
    /// Set to `Never` while a deliberate stop is in flight so the exit
    /// watcher does not race a restart against it.
    restart_override: Option<RestartPolicy>,
    /// True while a `start` call is mid-flight. Exit events arriving in that
    /// window are parked in `pending_exit` and applied once the start has
    /// finished its own transitions, preserving callback ordering.
    start_in_flight: bool,
    pending_exit: Option<Option<std::process::ExitStatus>>,
}

impl ServiceEntry {
    fn new(config: ServiceConfig) -> Self {
        let url = config.url.clone();
        Self {
            config,
            status: ServiceStatus {
                state: ServiceState::Stopped,
                pid: None,
                url,
            },
            proc: None,
            restart_override: None,
            start_in_flight: false,
            pending_exit: None,
        }
    }

    fn effective_restart(&self) -> RestartPolicy {
        self.restart_override.unwrap_or(self.config.restart)
    }
}

struct Inner {
    store: StateStore,
    http: reqwest::Client,
    prober: Box<dyn PortProber>,
    services: tokio::sync::Mutex<HashMap<String, ServiceEntry>>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(store: StateStore, prober: Box<dyn PortProber>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                http: probe_http_client(),
                prober,
                services: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(StateStore::in_dir(dir), Box::new(crate::probe::LsofProber))
    }

    pub async fn state(&self, name: &str) -> Option<ServiceStatus> {
        let services = self.inner.services.lock().await;
        services.get(name).map(|entry| entry.status.clone())
    }

    pub async fn all(&self) -> StateMap {
        let services = self.inner.services.lock().await;
        services
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status.clone()))
            .collect()
    }

    /// Adopts a PID the supervisor did not spawn (e.g. a stdio backend
    /// spawned by its client) so `ps`/`kill` and the next instance's reuse
    /// path see a consistent record.
    pub async fn register_pid(&self, name: &str, cfg: &ServiceConfig, pid: u32) -> anyhow::Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            let entry = services
                .entry(name.to_string())
                .or_insert_with(|| ServiceEntry::new(cfg.clone()));
            entry.status.state = ServiceState::Ready;
            entry.status.pid = Some(pid);
        }
        self.persist().await
    }

    /// Starts `name`: adopt a live persisted instance, else adopt an
    /// externally-started one reachable on its URL, else spawn and (for SSE
    /// transports) poll readiness.
    pub async fn start(&self, name: &str, cfg: &ServiceConfig) -> anyhow::Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            let entry = services
                .entry(name.to_string())
                .or_insert_with(|| ServiceEntry::new(cfg.clone()));
            if entry.proc.is_some() || entry.start_in_flight {
                anyhow::bail!("service already running: {name}");
            }
            entry.start_in_flight = true;
            entry.config = cfg.clone();
            entry.status.url = cfg.url.clone();
        }

        let result = self.start_inner(name, cfg).await;
        self.finish_start(name).await;
        result
    }

    async fn start_inner(&self, name: &str, cfg: &ServiceConfig) -> anyhow::Result<()> {
        if cfg.transport == Transport::Sse && self.try_adopt(name, cfg).await? {
            return Ok(());
        }
        self.spawn_service(name, cfg).await
    }

    /// Applies any exit event that arrived while this `start` was running.
    async fn finish_start(&self, name: &str) {
        let deferred = {
            let mut services = self.inner.services.lock().await;
            let Some(entry) = services.get_mut(name) else {
                return;
            };
            entry.start_in_flight = false;
            entry.pending_exit.take().map(|status| {
                (
                    entry.status.state,
                    entry.effective_restart(),
                    entry.config.clone(),
                    status,
                )
            })
        };
        if let Some((prior, policy, cfg, status)) = deferred {
            self.apply_exit(name, prior, policy, cfg, status).await;
        }
    }

    /// Reuse paths. Returns true if the service was adopted without
    /// spawning.
    async fn try_adopt(&self, name: &str, cfg: &ServiceConfig) -> anyhow::Result<bool> {
        let readiness_url = cfg
            .readiness_url()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("service {name} has no readiness url"))?;

        // A previous instance may have left a live child behind.
        let persisted = self.inner.store.load().await;
        if let Some(saved) = persisted.get(name) {
            if let Some(pid) = saved.pid {
                if pid_alive(pid)
                    && is_reachable(&self.inner.http, &readiness_url, PROBE_REQUEST_TIMEOUT).await
                {
                    info!(service = name, pid, "reusing running service");
                    self.set_status(name, ServiceState::Ready, Some(pid)).await?;
                    return Ok(true);
                }
            }
        }

        // Reachable but untracked: started externally. Try to recover the
        // PID from whoever is bound to the port.
        if is_reachable(&self.inner.http, &readiness_url, PROBE_REQUEST_TIMEOUT).await {
            let pid = match url_port(&readiness_url) {
                Some(port) => match self.inner.prober.listeners_on(port).await {
                    Ok(listeners) => match_listener(&listeners, &command_hints(cfg)),
                    Err(err) => {
                        debug!(service = name, error = %err, "port probe failed");
                        None
                    }
                },
                None => None,
            };
            info!(service = name, ?pid, "adopting externally started service");
            self.set_status(name, ServiceState::Ready, pid).await?;
            return Ok(true);
        }

        Ok(false)
    }

    fn spawn_service<'a>(
        &'a self,
        name: &'a str,
        cfg: &'a ServiceConfig,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move { self.spawn_service_inner(name, cfg).await })
    }

    async fn spawn_service_inner(&self, name: &str, cfg: &ServiceConfig) -> anyhow::Result<()> {
        self.set_status(name, ServiceState::Starting, None).await?;

        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args);
        if let Some(cwd) = &cfg.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &cfg.env {
            cmd.env(key, value);
        }
        // No pipes: the child must never block on a full stdio buffer.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn service {name}: {}", cfg.command))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("service {name} exited before pid was read"))?;

        let (exit_tx, exit_rx) = watch::channel(false);
        {
            let mut services = self.inner.services.lock().await;
            let entry = services
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("service entry vanished: {name}"))?;
            entry.proc = Some(ProcHandle { pid, exit_rx });
            entry.status.pid = Some(pid);
        }
        self.persist().await?;

        // The watcher owns the child from here on.
        let watcher = self.clone();
        let watcher_name = name.to_string();
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            let _ = exit_tx.send(true);
            watcher.handle_exit(&watcher_name, pid, status).await;
        });

        if cfg.transport == Transport::Sse {
            let readiness_url = cfg
                .readiness_url()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("service {name} has no readiness url"))?;
            if let Err(err) = self.await_ready(name, &readiness_url, cfg).await {
                // The child is an orphan now; don't leave it running.
                self.terminate_process(name).await;
                {
                    let mut services = self.inner.services.lock().await;
                    if let Some(entry) = services.get_mut(name) {
                        entry.restart_override = None;
                        entry.proc = None;
                        // The orphan's exit is our doing, not a crash.
                        entry.pending_exit = None;
                    }
                }
                self.set_status(name, ServiceState::Error, None).await?;
                return Err(err);
            }
        }

        self.set_status(name, ServiceState::Ready, Some(pid)).await?;
        info!(service = name, pid, "service ready");
        Ok(())
    }

    async fn await_ready(
        &self,
        name: &str,
        readiness_url: &str,
        cfg: &ServiceConfig,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + cfg.readiness.timeout;
        loop {
            if is_reachable(&self.inner.http, readiness_url, PROBE_REQUEST_TIMEOUT).await {
                return Ok(());
            }
            if tokio::time::Instant::now() + cfg.readiness.interval >= deadline {
                anyhow::bail!(
                    "service {name} timed out after {:?} waiting for {readiness_url}",
                    cfg.readiness.timeout
                );
            }
            tokio::time::sleep(cfg.readiness.interval).await;
        }
    }

    /// Stops `name`. A no-op (beyond normalizing recorded state) when
    /// nothing is tracked for it.
    pub async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let known = {
            let services = self.inner.services.lock().await;
            services.contains_key(name)
        };
        if !known {
            return Ok(());
        }

        self.terminate_process(name).await;

        {
            let mut services = self.inner.services.lock().await;
            if let Some(entry) = services.get_mut(name) {
                entry.restart_override = None;
                entry.proc = None;
                entry.status.state = ServiceState::Stopped;
                entry.status.pid = None;
            }
        }
        self.persist().await
    }

    /// SIGTERM, bounded wait, SIGKILL. Restart handling is suppressed for
    /// the duration so the exit watcher cannot resurrect the child.
    async fn terminate_process(&self, name: &str) {
        let proc = {
            let mut services = self.inner.services.lock().await;
            let Some(entry) = services.get_mut(name) else {
                return;
            };
            entry.restart_override = Some(RestartPolicy::Never);
            match &entry.proc {
                Some(proc) => Some((proc.pid, proc.exit_rx.clone())),
                None => entry.status.pid.map(|pid| {
                    // Not our child (recovered or registered pid): signal it,
                    // but there is no exit channel to await.
                    (pid, watch::channel(true).1)
                }),
            }
        };
        let Some((pid, mut exit_rx)) = proc else {
            return;
        };

        debug!(service = name, pid, "sending SIGTERM");
        send_signal(pid, libc::SIGTERM);

        let exited = tokio::time::timeout(STOP_GRACE, async {
            while !*exit_rx.borrow() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            warn!(service = name, pid, "SIGTERM grace expired, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
            while !*exit_rx.borrow() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub async fn restart(&self, name: &str) -> anyhow::Result<()> {
        let cfg = {
            let services = self.inner.services.lock().await;
            services
                .get(name)
                .map(|entry| entry.config.clone())
                .ok_or_else(|| anyhow::anyhow!("unknown service: {name}"))?
        };
        self.stop(name).await?;
        self.start(name, &cfg).await
    }

    /// Starts every service concurrently. If any fails, the ones that
    /// succeeded are stopped again and an aggregated error names each
    /// failure.
    pub async fn start_all(&self, configs: &[(String, ServiceConfig)]) -> anyhow::Result<()> {
        let outcomes = futures_util::future::join_all(configs.iter().map(|(name, cfg)| {
            let sup = self.clone();
            async move { (name.clone(), sup.start(name, cfg).await) }
        }))
        .await;

        let mut failures = Vec::new();
        let mut started = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => started.push(name),
                Err(err) => failures.push(format!("{name}: {err:#}")),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        for name in started {
            if let Err(err) = self.stop(&name).await {
                warn!(service = %name, error = %err, "rollback stop failed");
            }
        }
        anyhow::bail!("failed to start services: {}", failures.join("; "));
    }

    pub async fn stop_all(&self) -> anyhow::Result<()> {
        let names: Vec<String> = {
            let services = self.inner.services.lock().await;
            services.keys().cloned().collect()
        };
        for name in names {
            self.stop(&name).await?;
        }
        Ok(())
    }

    /// Exit watcher body. `pid` guards against acting on a stale callback
    /// after the service was already restarted.
    async fn handle_exit(&self, name: &str, pid: u32, status: Option<std::process::ExitStatus>) {
        let immediate = {
            let mut services = self.inner.services.lock().await;
            let Some(entry) = services.get_mut(name) else {
                return;
            };
            if entry.proc.as_ref().map(|p| p.pid) != Some(pid) {
                return;
            }
            entry.proc = None;
            if entry.start_in_flight {
                // Apply after the in-flight start has settled its own
                // transitions, mirroring event-loop callback ordering.
                entry.pending_exit = Some(status);
                None
            } else {
                Some((
                    entry.status.state,
                    entry.effective_restart(),
                    entry.config.clone(),
                ))
            }
        };

        if let Some((prior, policy, cfg)) = immediate {
            self.apply_exit(name, prior, policy, cfg, status).await;
        }
    }

    fn apply_exit<'a>(
        &'a self,
        name: &'a str,
        prior: ServiceState,
        policy: RestartPolicy,
        cfg: ServiceConfig,
        status: Option<std::process::ExitStatus>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move { self.apply_exit_inner(name, prior, policy, cfg, status).await })
    }

    async fn apply_exit_inner(
        &self,
        name: &str,
        prior: ServiceState,
        policy: RestartPolicy,
        cfg: ServiceConfig,
        status: Option<std::process::ExitStatus>,
    ) {
        let code = status.and_then(|s| s.code());
        debug!(service = name, ?code, prior = %prior, "service exited");

        let crashed = prior == ServiceState::Ready;
        let failed_during_start = code.map(|c| c != 0).unwrap_or(false) && !crashed;
        let clean = code == Some(0);

        if crashed {
            let _ = self.set_status(name, ServiceState::Error, None).await;
        } else if clean && prior != ServiceState::Starting {
            let _ = self.set_status(name, ServiceState::Stopped, None).await;
        }

        let should_restart = match policy {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => crashed || failed_during_start,
            RestartPolicy::Never => false,
        };
        if !should_restart {
            return;
        }

        // Restart off this callback's stack; an immediately-crashing child
        // must not recurse in-line.
        let sup = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            info!(service = %name, "restarting after exit");
            if let Err(err) = sup.start(&name, &cfg).await {
                warn!(service = %name, error = format!("{err:#}"), "restart failed");
            }
        });
    }

    async fn set_status(
        &self,
        name: &str,
        state: ServiceState,
        pid: Option<u32>,
    ) -> anyhow::Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            if let Some(entry) = services.get_mut(name) {
                entry.status.state = state;
                entry.status.pid = pid;
            }
        }
        self.persist().await
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let map = self.all().await;
        self.inner.store.save(&map).await
    }
}

/// Substrings used to recognize an externally-started service's process:
/// the executable's basename plus any non-flag argument.
fn command_hints(cfg: &ServiceConfig) -> Vec<String> {
    let mut hints = Vec::new();
    if let Some(basename) = Path::new(&cfg.command)
        .file_name()
        .and_then(|n| n.to_str())
    {
        hints.push(basename.to_string());
    }
    for arg in &cfg.args {
        if !arg.starts_with('-') && !arg.is_empty() {
            hints.push(arg.clone());
        }
    }
    hints
}

