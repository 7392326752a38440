use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_yaml::Value;

use super::model::{RestartPolicy, Transport};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ConfigFile {
    pub(super) services: BTreeMap<String, ServiceFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ServiceFile {
    #[serde(default)]
    pub(super) command: Option<String>,
    #[serde(default)]
    pub(super) args: Vec<String>,
    #[serde(default)]
    pub(super) transport: Option<Transport>,
    #[serde(default)]
    pub(super) url: Option<String>,
    #[serde(default)]
    pub(super) cwd: Option<PathBuf>,
    #[serde(default)]
    pub(super) env: BTreeMap<String, String>,
    #[serde(default)]
    pub(super) readiness: Option<ReadinessFile>,
    #[serde(default)]
    pub(super) restart: Option<RestartPolicy>,
    #[serde(default)]
    pub(super) keep_alive: Option<bool>,
    #[serde(default)]
    pub(super) exclude_tools: Vec<String>,
    #[serde(default)]
    pub(super) middleware: Option<MiddlewareFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ReadinessFile {
    #[serde(default)]
    pub(super) check: Option<String>,
    #[serde(default)]
    pub(super) url: Option<String>,
    #[serde(default)]
    pub(super) timeout: Option<DurationFile>,
    #[serde(default)]
    pub(super) interval: Option<DurationFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct MiddlewareFile {
    #[serde(default)]
    pub(super) response: Vec<MiddlewareEntryFile>,
}

/// `- strip-json-keys` or `- {name: cfg}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum MiddlewareEntryFile {
    Name(String),
    Configured(BTreeMap<String, Value>),
}

/// A duration: raw number of milliseconds, or `<num>(ms|s|m)`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum DurationFile {
    Millis(u64),
    Text(String),
}
