//! Durable service registry.
//!
//! A JSON map of service name → last-known runtime state, written on every
//! supervisor transition. A later daemon instance reads it to decide whether
//! a keep-alive backend can be adopted instead of spawned. This file is the
//! only cross-process coordination channel; the supervisor is its sole
//! writer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const STATE_FILE_NAME: &str = ".mcpd-state.json";
pub const PID_FILE_NAME: &str = ".mcpd.pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Ready,
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

pub type StateMap = BTreeMap<String, ServiceStatus>;

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the registry. A missing file is an empty registry; a corrupt
    /// file (e.g. a write torn by a crash) is logged and treated as empty.
    pub async fn load(&self) -> StateMap {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return StateMap::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read state file");
                return StateMap::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "state file is not valid JSON; starting from an empty registry"
                );
                StateMap::new()
            }
        }
    }

    /// Persists the registry atomically: write a sibling temp file, then
    /// rename over the target so readers never observe a torn write.
    pub async fn save(&self, map: &StateMap) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(map).context("serialize state")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

/// Writes the daemon PID file (plain decimal PID).
pub async fn write_pid_file(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join(PID_FILE_NAME);
    tokio::fs::write(&path, format!("{}\n", std::process::id()))
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Reads the daemon PID file, if present and parsable.
pub async fn read_pid_file(dir: &Path) -> Option<u32> {
    let path = dir.join(PID_FILE_NAME);
    let text = tokio::fs::read_to_string(&path).await.ok()?;
    text.trim().parse().ok()
}

pub async fn remove_pid_file(dir: &Path) {
    let _ = tokio::fs::remove_file(dir.join(PID_FILE_NAME)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::in_dir(dir.path());

        let mut map = StateMap::new();
        map.insert(
            "svc".to_string(),
            ServiceStatus {
                state: ServiceState::Ready,
                pid: Some(4242),
                url: Some("http://127.0.0.1:9000".to_string()),
            },
        );
        map.insert(
            "other".to_string(),
            ServiceStatus {
                state: ServiceState::Stopped,
                pid: None,
                url: None,
            },
        );

        store.save(&map).await.unwrap();
        assert_eq!(store.load().await, map);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::in_dir(dir.path());
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::in_dir(dir.path());
        tokio::fs::write(store.path(), b"{ torn")
            .await
            .unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_pid_file(dir.path()).await.unwrap();
        assert_eq!(read_pid_file(dir.path()).await, Some(std::process::id()));
        remove_pid_file(dir.path()).await;
        assert_eq!(read_pid_file(dir.path()).await, None);
    }
}
