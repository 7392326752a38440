use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::file_format::ConfigFile;
use super::model::ServiceConfig;
use super::{Config, MAX_CONFIG_BYTES};
use crate::ServiceName;

const CONFIG_FILE_NAME: &str = "mcpd.yml";
const USER_CONFIG_SUFFIX: &str = ".config/mcpd/config.yml";

impl Config {
    /// Loads the config: an explicit `override_path` (an error if missing),
    /// else `<root>/mcpd.yml`, else `~/.config/mcpd/config.yml`.
    pub async fn load(root: &Path, override_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = override_path {
            let resolved = if path.is_absolute() {
                path
            } else {
                root.join(path)
            };
            let text = read_config_limited(&resolved).await?;
            return Self::parse(&text, root, Some(resolved));
        }

        let project = root.join(CONFIG_FILE_NAME);
        if tokio::fs::try_exists(&project).await.unwrap_or(false) {
            let text = read_config_limited(&project).await?;
            return Self::parse(&text, root, Some(project));
        }

        if let Some(home) = std::env::var_os("HOME") {
            let user = PathBuf::from(home).join(USER_CONFIG_SUFFIX);
            if tokio::fs::try_exists(&user).await.unwrap_or(false) {
                let text = read_config_limited(&user).await?;
                return Self::parse(&text, root, Some(user));
            }
        }

        anyhow::bail!(
            "no config found: looked for {} and ~/{}",
            project.display(),
            USER_CONFIG_SUFFIX
        );
    }

    pub fn parse(text: &str, root: &Path, path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut tree: serde_yaml::Value = serde_yaml::from_str(text)
            .with_context(|| match &path {
                Some(path) => format!("parse {}", path.display()),
                None => "parse config".to_string(),
            })?;
        expand_tree(&mut tree, root);

        let file: ConfigFile = serde_yaml::from_value(tree).with_context(|| match &path {
            Some(path) => format!("invalid config: {}", path.display()),
            None => "invalid config".to_string(),
        })?;

        let mut services = BTreeMap::new();
        for (name, service_file) in file.services {
            let service_name = ServiceName::parse(&name)
                .map_err(|err| anyhow::anyhow!("services.{name}: {err}"))?;
            let service = ServiceConfig::from_file(&name, service_file)?;
            services.insert(service_name, service);
        }

        Ok(Self { path, services })
    }
}

async fn read_config_limited(path: &Path) -> anyhow::Result<String> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("config must be a regular file: {}", path.display());
    }
    if meta.len() > MAX_CONFIG_BYTES {
        anyhow::bail!(
            "config too large: {} bytes (max {}): {}",
            meta.len(),
            MAX_CONFIG_BYTES,
            path.display()
        );
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))
}

/// Expands `${env.VAR}`, `${workspaceRoot}` and `${home}` in `template`.
/// Unknown placeholders (including unset environment variables) are left
/// literal.
pub fn expand_placeholders(template: &str, root: &Path) -> String {
    if !template.contains("${") {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        let replacement = match name {
            "workspaceRoot" => Some(root.display().to_string()),
            "home" => std::env::var("HOME").ok(),
            _ => name
                .strip_prefix("env.")
                .and_then(|var| std::env::var(var).ok()),
        };
        match replacement {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn expand_tree(value: &mut serde_yaml::Value, root: &Path) {
    match value {
        serde_yaml::Value::String(text) => {
            *text = expand_placeholders(text, root);
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                expand_tree(item, root);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                expand_tree(item, root);
            }
        }
        _ => {}
    }
}
