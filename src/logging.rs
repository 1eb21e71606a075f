//! Process-wide log subscriber setup.
//!
//! Components log through `tracing` with structured fields. Applications call
//! [`init`] once; `RUST_LOG` overrides the configured filter.

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::{Result, TracklineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `"info,trackline::icesat2=debug"`
    pub filter: String,
    pub thread_names: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "info".to_string(), thread_names: true, ansi: true }
    }
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| {
            TracklineError::config(format!("invalid log filter '{}': {e}", config.filter))
        }),
    }
}

/// Installs the global fmt subscriber; a subscriber that is already set is left in place.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let layer = fmt::layer()
        .with_thread_names(config.thread_names)
        .with_ansi(config.ansi)
        .with_filter(env_filter(config)?);

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("log subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig { ansi: false, ..LoggingConfig::default() };
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }

    #[test]
    fn bad_filter_is_a_config_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig { filter: "trackline=notalevel".into(), ..LoggingConfig::default() };
        assert!(matches!(init(&config), Err(TracklineError::Config { .. })));
    }
}
