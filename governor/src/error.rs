//! Governor error types
//!
//! Admission errors (`CircuitOpen`, `RequestExpired`) and `RequestTimeout`
//! are synthesized by the governor itself. Anything the wrapped operation
//! returns comes back unchanged inside [`GovernorError::Operation`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned from [`crate::RequestGovernor::submit`] and
/// [`crate::CircuitBreaker::execute`].
#[derive(Error, Debug)]
pub enum GovernorError<E> {
    /// The breaker for this dependency refused the call.
    ///
    /// Transient. The governor never retries this on the caller's behalf.
    #[error("Circuit '{breaker}' is open; retry after {retry_after_ms}ms")]
    CircuitOpen { breaker: String, retry_after_ms: u64 },

    /// The operation exceeded the active policy's timeout. Outcome unknown.
    #[error("Request '{name}' timed out after {timeout_ms}ms")]
    RequestTimeout { name: String, timeout_ms: u64 },

    /// The request waited in the admission queue past the expiry horizon.
    /// Safe to retry fresh.
    #[error("Request '{name}' expired after waiting {waited_ms}ms in queue")]
    RequestExpired { name: String, waited_ms: u64 },

    /// The operation's own error.
    #[error(transparent)]
    Operation(E),
}

impl<E> GovernorError<E> {
    /// Create a circuit open error
    pub fn circuit_open(breaker: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::CircuitOpen {
            breaker: breaker.into(),
            retry_after_ms,
        }
    }

    /// Create a request timeout error
    pub fn timeout(name: impl Into<String>, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            name: name.into(),
            timeout_ms,
        }
    }

    /// Create a request expired error
    pub fn expired(name: impl Into<String>, waited_ms: u64) -> Self {
        Self::RequestExpired {
            name: name.into(),
            waited_ms,
        }
    }

    /// Whether the governor produced this error before running the operation.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RequestExpired { .. })
    }

    /// Whether submitting the same work again later is reasonable.
    ///
    /// `CircuitOpen` is retryable only after backing off; the caller owns
    /// that decision.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Operation(_))
    }

    /// Whether this outcome counts against the dependency's health.
    pub fn is_failure_signal(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. } | Self::Operation(_))
    }

    /// Stable machine-readable code, useful for log fields and dashboards.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::RequestExpired { .. } => "REQUEST_EXPIRED",
            Self::Operation(_) => "OPERATION_FAILED",
        }
    }

    /// Extract the operation's own error, if that is what this is.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for governed operations
pub type GovernorResult<T, E> = Result<T, GovernorError<E>>;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    /// Create an invalid configuration error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Result type alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
