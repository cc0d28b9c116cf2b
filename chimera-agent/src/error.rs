//! Error taxonomy and its mapping onto wire status codes.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::StatusCode;
use crate::systemd::{JobResult, JobVerb};

/// Errors raised while loading settings or desired-state documents.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Provider failures, typed by whether a retry can help.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{operation} failed: {message}")]
    Retryable { operation: String, message: String },

    #[error("{operation} failed permanently: {message}")]
    Permanent { operation: String, message: String },

    #[error("operation not supported by the {0} provider")]
    Unsupported(&'static str),
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Retryable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable { .. })
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        ProviderError::retryable("io", e.to_string())
    }
}

/// Failures talking to the service manager itself.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("init system unavailable: {0}")]
    Unavailable(String),
}

/// Everything a request or an action can fail with.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("container {container}: unknown {kind} '{reference}'")]
    ConfigResolution {
        container: String,
        kind: &'static str,
        reference: String,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{verb} {unit}: job finished with result '{result}'")]
    JobFailure {
        unit: String,
        verb: JobVerb,
        result: JobResult,
    },

    #[error("{verb} {unit}: job did not complete within {timeout:?}")]
    JobTimeout {
        unit: String,
        verb: JobVerb,
        timeout: Duration,
    },

    #[error("{name}: expected {expected}, observed {observed}")]
    Unconverged {
        name: String,
        expected: String,
        observed: String,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("permission denied: {0}")]
    Authorization(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("container {0} is not running")]
    NotRunning(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request did not finish within {0:?}")]
    RequestTimeout(Duration),

    #[error("plan from generation {planned} superseded by generation {current}")]
    Superseded { planned: u64, current: u64 },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("internal: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether retrying the same action may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Provider(e) => e.is_retryable(),
            AgentError::JobFailure { .. }
            | AgentError::JobTimeout { .. }
            | AgentError::Unconverged { .. } => true,
            AgentError::Backend(BackendError::Command { .. }) => true,
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::ConfigResolution { .. } | AgentError::NotFound(_) => StatusCode::NotFound,
            AgentError::Provider(_)
            | AgentError::JobFailure { .. }
            | AgentError::Unconverged { .. }
            | AgentError::Backend(_)
            | AgentError::Config(_) => StatusCode::UpstreamFailure,
            AgentError::JobTimeout { .. } | AgentError::RequestTimeout(_) => StatusCode::Timeout,
            AgentError::Authorization(_) => StatusCode::Denied,
            AgentError::Conflict(_) | AgentError::NotRunning(_) | AgentError::Superseded { .. } => {
                StatusCode::Conflict
            }
            AgentError::BadRequest(_) => StatusCode::BadRequest,
            AgentError::Connection(_) | AgentError::Internal(_) => StatusCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let timeout = AgentError::JobTimeout {
            unit: "systemd-nspawn@web1.service".to_string(),
            verb: JobVerb::Start,
            timeout: Duration::from_secs(90),
        };
        assert_eq!(timeout.status_code(), StatusCode::Timeout);
        assert!(timeout.is_retryable());

        let unresolved = AgentError::ConfigResolution {
            container: "web1".to_string(),
            kind: "profile",
            reference: "missing".to_string(),
        };
        assert_eq!(unresolved.status_code(), StatusCode::NotFound);
        assert!(!unresolved.is_retryable());

        let permanent = AgentError::from(ProviderError::permanent("clone", "no space"));
        assert_eq!(permanent.status_code(), StatusCode::UpstreamFailure);
        assert!(!permanent.is_retryable());
    }
}
