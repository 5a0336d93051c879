//! Logging setup for embedders and tests.
//!
//! The coordinator only emits `tracing` events. Installing a subscriber is
//! left to whoever owns the process; [`init_logging`] is the default one,
//! driven by [`crate::config::LogSettings`].

use crate::error::ConfigError;
use crate::types::SessionId;
use std::str::FromStr;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer,
    Registry,
};

/// Target of every event this crate emits.
pub const LOG_TARGET: &str = "rustkit_swserver";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::Log(format!("unknown format '{}'", name))),
        }
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// `EnvFilter` directive replacing the level-based default.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// The filter directive in effect: the custom one, else `RUST_LOG`, else
    /// this crate at `level`.
    pub fn directive(&self) -> String {
        match self.filter {
            Some(ref custom) => custom.clone(),
            None => std::env::var(EnvFilter::DEFAULT_ENV)
                .unwrap_or_else(|_| format!("{}={}", LOG_TARGET, self.level)),
        }
    }
}

/// Install a global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_new(config.directive())
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", LOG_TARGET, config.level)));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
}

/// Span wrapping everything one coordinator task logs.
pub fn server_span(session: SessionId) -> Span {
    tracing::info_span!(target: LOG_TARGET, "swserver", %session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(ConfigError::Log(_))
        ));
    }

    #[test]
    fn test_custom_filter_wins() {
        let config = LogConfig::default().with_filter("rustkit_swserver=trace");
        assert_eq!(config.directive(), "rustkit_swserver=trace");
    }

    #[test]
    fn test_init_twice_is_an_error_not_a_panic() {
        let config = LogConfig {
            level: Level::DEBUG,
            format: LogFormat::Compact,
            filter: Some("rustkit_swserver=debug".into()),
        };
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
