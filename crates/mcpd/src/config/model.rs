use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::file_format::{DurationFile, MiddlewareEntryFile, ReadinessFile, ServiceFile};
use super::{DEFAULT_READINESS_INTERVAL_MS, DEFAULT_READINESS_TIMEOUT_MS};
use crate::ServiceName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Sse,
    Stdio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    OnFailure,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessConfig {
    /// Probe URL override; falls back to the service `url`.
    pub url: Option<String>,
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_millis(DEFAULT_READINESS_TIMEOUT_MS),
            interval: Duration::from_millis(DEFAULT_READINESS_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MiddlewareSpec {
    pub name: String,
    /// Transform-specific configuration; the built-ins take none today.
    pub config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub command: String,
    pub args: Vec<String>,
    pub transport: Transport,
    pub url: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub readiness: ReadinessConfig,
    pub restart: RestartPolicy,
    /// Keep-alive services survive daemon shutdown for reuse by a later
    /// instance.
    pub keep_alive: bool,
    pub exclude_tools: HashSet<String>,
    pub response_middleware: Vec<MiddlewareSpec>,
}

impl ServiceConfig {
    /// The URL polled for readiness: the explicit readiness URL if set, else
    /// the service URL.
    pub fn readiness_url(&self) -> Option<&str> {
        self.readiness.url.as_deref().or(self.url.as_deref())
    }

    pub(super) fn from_file(name: &str, file: ServiceFile) -> anyhow::Result<Self> {
        let command = file
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("services.{name}.command is required"))?;

        let transport = file.transport.unwrap_or_default();
        let url = file.url;
        if transport == Transport::Sse && url.is_none() {
            anyhow::bail!("services.{name}.url is required for transport=sse");
        }

        let readiness = match file.readiness {
            Some(readiness) => ReadinessConfig::from_file(name, readiness)?,
            None => ReadinessConfig::default(),
        };

        let mut response_middleware = Vec::new();
        for (idx, entry) in file
            .middleware
            .map(|m| m.response)
            .unwrap_or_default()
            .into_iter()
            .enumerate()
        {
            let spec = match entry {
                MiddlewareEntryFile::Name(mw_name) => MiddlewareSpec {
                    name: mw_name,
                    config: None,
                },
                MiddlewareEntryFile::Configured(map) => {
                    let mut entries = map.into_iter();
                    match (entries.next(), entries.next()) {
                        (Some((mw_name, config)), None) => MiddlewareSpec {
                            name: mw_name,
                            config: Some(config),
                        },
                        _ => anyhow::bail!(
                            "services.{name}.middleware.response[{idx}] must be a string or a single-key map"
                        ),
                    }
                }
            };
            if !crate::middleware::is_known(&spec.name) {
                anyhow::bail!(
                    "services.{name}.middleware.response[{idx}]: unknown middleware {:?}",
                    spec.name
                );
            }
            response_middleware.push(spec);
        }

        Ok(Self {
            command,
            args: file.args,
            transport,
            url,
            cwd: file.cwd,
            env: file.env,
            readiness,
            restart: file.restart.unwrap_or_default(),
            keep_alive: file.keep_alive.unwrap_or(true),
            exclude_tools: file.exclude_tools.into_iter().collect(),
            response_middleware,
        })
    }
}

impl ReadinessConfig {
    fn from_file(name: &str, file: ReadinessFile) -> anyhow::Result<Self> {
        if let Some(check) = file.check.as_deref() {
            if check != "http" {
                anyhow::bail!("services.{name}.readiness.check: only \"http\" is recognized, got {check:?}");
            }
        }
        let timeout = match file.timeout {
            Some(value) => parse_duration(&value)
                .map_err(|err| anyhow::anyhow!("services.{name}.readiness.timeout: {err}"))?,
            None => Duration::from_millis(DEFAULT_READINESS_TIMEOUT_MS),
        };
        let interval = match file.interval {
            Some(value) => parse_duration(&value)
                .map_err(|err| anyhow::anyhow!("services.{name}.readiness.interval: {err}"))?,
            None => Duration::from_millis(DEFAULT_READINESS_INTERVAL_MS),
        };
        Ok(Self {
            url: file.url,
            timeout,
            interval,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(super) path: Option<PathBuf>,
    pub(super) services: BTreeMap<ServiceName, ServiceConfig>,
}

impl Config {
    pub fn new(services: BTreeMap<ServiceName, ServiceConfig>) -> Self {
        Self {
            path: None,
            services,
        }
    }

    /// Path the config was loaded from, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub fn services(&self) -> &BTreeMap<ServiceName, ServiceConfig> {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }
}

pub(super) fn parse_duration(value: &DurationFile) -> anyhow::Result<Duration> {
    let millis = match value {
        DurationFile::Millis(ms) => *ms,
        DurationFile::Text(text) => {
            let text = text.trim();
            let (digits, unit) = match text.find(|ch: char| !ch.is_ascii_digit()) {
                Some(pos) => text.split_at(pos),
                None => (text, "ms"),
            };
            let number: u64 = digits
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid duration: {text:?}"))?;
            match unit.trim() {
                "ms" => number,
                "s" => number.saturating_mul(1_000),
                "m" => number.saturating_mul(60_000),
                other => anyhow::bail!("invalid duration unit {other:?} (allowed: ms, s, m)"),
            }
        }
    };
    if millis == 0 {
        anyhow::bail!("duration must be positive");
    }
    Ok(Duration::from_millis(millis))
}
