//! `mcpd.yml` loader + validation.

mod file_format;
mod load;
mod model;

#[cfg(test)]
mod tests;

pub use load::expand_placeholders;
pub use model::{
    Config, MiddlewareSpec, ReadinessConfig, RestartPolicy, ServiceConfig, Transport,
};

pub(crate) const MAX_CONFIG_BYTES: u64 = 4 * 1024 * 1024;
pub(crate) const DEFAULT_READINESS_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_READINESS_INTERVAL_MS: u64 = 500;
