//! Error types for the service worker coordinator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported back to clients when a job or worker operation fails.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceWorkerError {
    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Installation failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service worker context was terminated")]
    ContextTerminated,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Aborted: {0}")]
    Aborted(String),
}

impl ServiceWorkerError {
    /// Short, stable name used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceWorkerError::TypeError(_) => "type",
            ServiceWorkerError::SecurityError(_) => "security",
            ServiceWorkerError::NetworkError(_) => "network",
            ServiceWorkerError::ScriptError(_) => "script",
            ServiceWorkerError::InstallFailed(_) => "install_failed",
            ServiceWorkerError::StateError(_) => "state",
            ServiceWorkerError::NotFound(_) => "not_found",
            ServiceWorkerError::ContextTerminated => "context_terminated",
            ServiceWorkerError::ConnectionClosed => "connection_closed",
            ServiceWorkerError::Aborted(_) => "aborted",
        }
    }
}

/// Errors raised by a registration store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid log setting: {0}")]
    Log(String),
}
