use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcpd::aggregator::ToolAggregator;
use mcpd::client::{BackendClient, StdioOptions};
use mcpd::config::{Config, RestartPolicy, ServiceConfig, Transport};
use mcpd::front::FrontServer;
use mcpd::middleware;
use mcpd::probe::{pid_alive, send_signal};
use mcpd::proxy;
use mcpd::state::{read_pid_file, remove_pid_file, write_pid_file, StateStore};
use mcpd::Supervisor;

#[derive(Parser)]
#[command(name = "mcpd")]
#[command(about = "MCP multiplexing daemon: one stdio entry point over many backend tool servers")]
#[command(version)]
struct Cli {
    /// Override the config search path (default: ./mcpd.yml, then
    /// ~/.config/mcpd/config.yml).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon: supervise services and expose the aggregated tool
    /// inventory over stdio (default).
    Start,
    /// Show daemon status and per-service pid/url/state.
    #[command(alias = "list", alias = "ls")]
    Ps,
    /// SIGTERM the tracked PID(s).
    Kill {
        #[arg(default_value = "all")]
        target: String,
    },
    /// Kill tracked PID(s), wait a moment, then start SSE services again.
    Restart {
        #[arg(default_value = "all")]
        target: String,
    },
    /// Equivalent to `kill all`.
    Stop,
    /// Run the stdio↔SSE proxy in front of a stdio MCP server.
    Proxy {
        /// Port to bind (0 = OS-assigned).
        #[arg(short, long)]
        port: u16,
        /// Service name for the state entry (default: command basename).
        #[arg(short, long)]
        name: Option<String>,
        /// Reconnect policy when the backend exits.
        #[arg(long, default_value = "on-failure", value_parser = parse_restart_policy)]
        restart: RestartPolicy,
        /// Backend command and arguments.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

fn parse_restart_policy(text: &str) -> Result<RestartPolicy, String> {
    match text {
        "on-failure" => Ok(RestartPolicy::OnFailure),
        "always" => Ok(RestartPolicy::Always),
        "never" => Ok(RestartPolicy::Never),
        other => Err(format!(
            "invalid restart policy {other:?} (allowed: on-failure, always, never)"
        )),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout belongs to the MCP wire; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let result = match cli.command.unwrap_or(Command::Start) {
        Command::Start => run_start(&root, cli.config).await,
        Command::Ps => run_ps(&root).await,
        Command::Kill { target } => run_kill(&root, &target).await,
        Command::Restart { target } => run_restart(&root, cli.config, &target).await,
        Command::Stop => run_kill(&root, "all").await,
        Command::Proxy {
            port,
            name,
            restart,
            command,
        } => run_proxy(&root, port, name, restart, command).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("mcpd: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_start(root: &std::path::Path, config_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = Config::load(root, config_path).await?;
    write_pid_file(root).await?;

    let supervisor = Supervisor::in_dir(root);

    // SSE services run under supervision; stdio backends are spawned by
    // their clients below.
    let supervised: Vec<(String, ServiceConfig)> = config
        .services()
        .iter()
        .filter(|(_, cfg)| cfg.transport == Transport::Sse)
        .map(|(name, cfg)| (name.to_string(), cfg.clone()))
        .collect();
    if let Err(err) = supervisor.start_all(&supervised).await {
        remove_pid_file(root).await;
        return Err(err);
    }

    let aggregator = Arc::new(ToolAggregator::new());
    let mut pipelines = HashMap::new();
    let mut clients: Vec<Arc<BackendClient>> = Vec::new();

    for (name, cfg) in config.services() {
        let connected = connect_backend(&supervisor, name.as_str(), cfg).await;
        let client = match connected {
            Ok(client) => client,
            Err(err) => {
                // Roll back everything we brought up before surfacing.
                warn!(service = %name, error = format!("{err:#}"), "backend connect failed");
                for (started, _) in &supervised {
                    let _ = supervisor.stop(started).await;
                }
                remove_pid_file(root).await;
                return Err(err.context(format!("connect backend: {name}")));
            }
        };
        clients.push(client.clone());
        aggregator
            .add_backend(name.as_str(), client, cfg.exclude_tools.clone())
            .await;
        pipelines.insert(
            name.to_string(),
            middleware::pipeline_from_specs(&cfg.response_middleware)?,
        );
    }

    info!(services = config.services().len(), "mcpd ready on stdio");
    let front = Arc::new(FrontServer::new(aggregator.clone(), pipelines));
    let mut serve = tokio::spawn(front.serve_stdio());

    tokio::select! {
        result = &mut serve => {
            match result {
                Ok(Ok(())) => info!("stdio closed"),
                Ok(Err(err)) => warn!(error = format!("{err:#}"), "front server failed"),
                Err(err) => warn!(error = %err, "front server panicked"),
            }
        }
        _ = shutdown_signal() => {
            info!("signal received, shutting down");
            // Drops the front server (and its aggregator references) so the
            // backend clients below can be unwrapped and closed.
            serve.abort();
            let _ = serve.await;
        }
    }

    // Keep-alive services survive for the next instance; the rest stop.
    for (name, cfg) in config.services() {
        if cfg.transport == Transport::Sse && !cfg.keep_alive {
            if let Err(err) = supervisor.stop(name.as_str()).await {
                warn!(service = %name, error = format!("{err:#}"), "stop failed");
            }
        }
    }

    drop(aggregator);
    for client in clients {
        if let Ok(client) = Arc::try_unwrap(client) {
            if let Err(err) = client.disconnect().await {
                warn!(error = format!("{err:#}"), "backend disconnect failed");
            }
        }
    }

    remove_pid_file(root).await;
    Ok(ExitCode::SUCCESS)
}

async fn connect_backend(
    supervisor: &Supervisor,
    name: &str,
    cfg: &ServiceConfig,
) -> anyhow::Result<Arc<BackendClient>> {
    match cfg.transport {
        Transport::Sse => {
            let url = cfg
                .url
                .as_deref()
                .context("sse service without url")?;
            Ok(Arc::new(BackendClient::connect(url).await?))
        }
        Transport::Stdio => {
            let client = BackendClient::connect_stdio(
                &cfg.command,
                &cfg.args,
                StdioOptions {
                    cwd: cfg.cwd.clone(),
                    env: cfg.env.clone(),
                },
            )
            .await?;
            // The client owns the child; the supervisor still needs to know
            // the pid for ps/kill and the next instance's reuse logic.
            if let Some(pid) = client.pid() {
                supervisor.register_pid(name, cfg, pid).await?;
            }
            Ok(Arc::new(client))
        }
    }
}

async fn run_ps(root: &std::path::Path) -> anyhow::Result<ExitCode> {
    match read_pid_file(root).await {
        Some(pid) if pid_alive(pid) => println!("daemon: running (pid {pid})"),
        Some(pid) => println!("daemon: not running (stale pid file, pid {pid})"),
        None => println!("daemon: not running"),
    }

    let map = StateStore::in_dir(root).load().await;
    if map.is_empty() {
        println!("no services tracked");
        return Ok(ExitCode::SUCCESS);
    }
    for (name, status) in &map {
        let pid = status
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let url = status.url.as_deref().unwrap_or("-");
        println!("{name}\tpid={pid}\turl={url}\tstate={}", status.state);
    }
    Ok(ExitCode::SUCCESS)
}

/// SIGTERMs the tracked pid(s). Returns false when `target` names an
/// unknown service.
async fn kill_services(root: &std::path::Path, target: &str) -> bool {
    let map = StateStore::in_dir(root).load().await;

    let targets: Vec<(&String, &mcpd::state::ServiceStatus)> = if target == "all" {
        map.iter().collect()
    } else {
        match map.get_key_value(target) {
            Some(entry) => vec![entry],
            None => {
                eprintln!("mcpd: unknown service: {target}");
                return false;
            }
        }
    };

    for (name, status) in targets {
        match status.pid {
            Some(pid) if pid_alive(pid) => {
                println!("killing {name} (pid {pid})");
                send_signal(pid, libc::SIGTERM);
            }
            _ => println!("{name}: not running"),
        }
    }
    true
}

async fn run_kill(root: &std::path::Path, target: &str) -> anyhow::Result<ExitCode> {
    if kill_services(root, target).await {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn run_restart(
    root: &std::path::Path,
    config_path: Option<PathBuf>,
    target: &str,
) -> anyhow::Result<ExitCode> {
    let config = Config::load(root, config_path).await?;
    if target != "all" && config.service(target).is_none() {
        eprintln!("mcpd: unknown service: {target}");
        return Ok(ExitCode::FAILURE);
    }

    if !kill_services(root, target).await {
        return Ok(ExitCode::FAILURE);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let supervisor = Supervisor::in_dir(root);
    let supervised: Vec<(String, ServiceConfig)> = config
        .services()
        .iter()
        .filter(|(name, cfg)| {
            cfg.transport == Transport::Sse && (target == "all" || name.as_str() == target)
        })
        .map(|(name, cfg)| (name.to_string(), cfg.clone()))
        .collect();
    supervisor.start_all(&supervised).await?;
    println!("restarted {} service(s)", supervised.len());
    Ok(ExitCode::SUCCESS)
}

async fn run_proxy(
    root: &std::path::Path,
    port: u16,
    name: Option<String>,
    restart: RestartPolicy,
    command: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let (program, args) = command
        .split_first()
        .context("proxy requires a backend command")?;
    let name = proxy::derive_name(name.as_deref(), program);

    let handle = proxy::start(
        proxy::ProxyOptions {
            port,
            name,
            restart,
            state_dir: Some(root.to_path_buf()),
        },
        proxy::stdio_backend_factory(program.clone(), args.to_vec()),
    )
    .await?;

    tokio::select! {
        _ = shutdown_signal() => {
            info!("signal received, shutting down proxy");
            handle.shutdown();
        }
        // The proxy can also end on its own (reconnect policy gave up).
        _ = handle.wait_for_state(proxy::ProxyState::ShuttingDown) => {}
    }
    handle.wait().await?;
    Ok(ExitCode::SUCCESS)
}

/// Resolves on SIGINT or SIGTERM; repeated signals are absorbed by the
/// shutdown already in flight.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
