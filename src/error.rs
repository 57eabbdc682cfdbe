//! Error taxonomy for the trading services
//!
//! Broker failures are split into transient (retryable) and permanent
//! (drop the order/signal) classes; state-file failures carry enough
//! context to decide between quarantine and abort.

use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the brokerage API
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Rate limit, 5xx, or network blip; retried with backoff
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Rejected order, unknown symbol, insufficient buying power; not retried
    #[error("permanent broker error: {0}")]
    Permanent(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    /// Classify an HTTP status + body into the retry taxonomy
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status.as_u16() == 429 || status.is_server_error() {
            BrokerError::Transient(format!("HTTP {status}: {body}"))
        } else {
            BrokerError::Permanent(format!("HTTP {status}: {body}"))
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        // Connect/timeout/body errors are network blips; retry them
        BrokerError::Transient(e.to_string())
    }
}

/// Failures in the shared state substrate
#[derive(Debug, Error)]
pub enum StateError {
    #[error("could not acquire lock on {path} within {timeout_secs}s")]
    LockTimeout { path: PathBuf, timeout_secs: u64 },

    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("state I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Startup configuration problems; always fatal
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("broker connection test failed: {0}")]
    ConnectionTest(String),

    #[error("could not read config file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}
