//! Error types shared by orchestrations, activities and the runtime.
//!
//! [`ErrorDetails`] is the durable form: it is stored inside history events and
//! handed to orchestration code, so it must stay serializable and stable.
//! The `thiserror` enums below it are the in-process errors returned by the
//! client and runtime APIs.

use serde::{Deserialize, Serialize};

use crate::providers::ProviderError;

/// Which registry lookup or validation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    UnknownOrchestration,
    UnknownActivity,
    DuplicateRegistration,
    InvalidOption,
}

impl std::fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfigErrorKind::UnknownOrchestration => "unknown orchestration",
            ConfigErrorKind::UnknownActivity => "unknown activity",
            ConfigErrorKind::DuplicateRegistration => "duplicate registration",
            ConfigErrorKind::InvalidOption => "invalid option",
        };
        f.write_str(s)
    }
}

/// Structured failure recorded in history and surfaced to orchestration code.
///
/// `ActivityExecution` and `Timeout` are meant to be handled by orchestration
/// logic. `OrchestrationLogic` is fatal to the instance and is never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorDetails {
    #[error("activity '{activity}' failed after {attempts} attempt(s): {message}")]
    ActivityExecution {
        activity: String,
        attempts: u32,
        message: String,
    },
    #[error("timed out after {after_ms}ms waiting for event '{event}'")]
    Timeout { event: String, after_ms: u64 },
    #[error("orchestration logic error: {message}")]
    OrchestrationLogic { message: String },
    #[error("termination requested: {reason}")]
    TerminationRequested { reason: String },
    #[error("configuration error ({kind}): {name}")]
    Configuration {
        #[serde(rename = "config_kind")]
        kind: ConfigErrorKind,
        name: String,
    },
    #[error("{message}")]
    Application { message: String },
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl ErrorDetails {
    pub fn logic(message: impl Into<String>) -> Self {
        ErrorDetails::OrchestrationLogic {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        ErrorDetails::Serialization {
            message: message.into(),
        }
    }

    /// Message of the underlying failure without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            ErrorDetails::ActivityExecution { message, .. }
            | ErrorDetails::OrchestrationLogic { message }
            | ErrorDetails::Application { message }
            | ErrorDetails::Serialization { message } => message,
            ErrorDetails::TerminationRequested { reason } => reason,
            ErrorDetails::Configuration { name, .. } => name,
            ErrorDetails::Timeout { event, .. } => event,
        }
    }

    /// True for failures that orchestration code is expected to catch and branch on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorDetails::ActivityExecution { .. } | ErrorDetails::Timeout { .. }
        )
    }
}

/// Registry and option validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("orchestration '{0}' is not registered")]
    UnknownOrchestration(String),
    #[error("activity '{0}' is not registered")]
    UnknownActivity(String),
    #[error("{kind} '{name}' registered more than once")]
    Duplicate { kind: &'static str, name: String },
    #[error("invalid runtime option: {0}")]
    InvalidOption(String),
    #[error("{}", .0.join("; "))]
    Multiple(Vec<String>),
}

impl From<&ConfigError> for ErrorDetails {
    fn from(err: &ConfigError) -> Self {
        let (kind, name) = match err {
            ConfigError::UnknownOrchestration(n) => (ConfigErrorKind::UnknownOrchestration, n.clone()),
            ConfigError::UnknownActivity(n) => (ConfigErrorKind::UnknownActivity, n.clone()),
            ConfigError::Duplicate { name, .. } => (ConfigErrorKind::DuplicateRegistration, name.clone()),
            ConfigError::InvalidOption(msg) => (ConfigErrorKind::InvalidOption, msg.clone()),
            ConfigError::Multiple(msgs) => (ConfigErrorKind::InvalidOption, msgs.join("; ")),
        };
        ErrorDetails::Configuration { kind, name }
    }
}

/// Errors returned by [`crate::Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("instance '{0}' not found")]
    NotFound(String),
    #[error("instance '{0}' already exists")]
    AlreadyExists(String),
    #[error("instance '{0}' is not running")]
    NotRunning(String),
    #[error("timed out waiting for instance '{0}'")]
    WaitTimeout(String),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Provider(ProviderError),
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

impl From<ProviderError> for ClientError {
    fn from(err: ProviderError) -> Self {
        use crate::providers::ProviderErrorKind;
        match err.kind {
            ProviderErrorKind::NotFound => ClientError::NotFound(err.message),
            ProviderErrorKind::AlreadyExists => ClientError::AlreadyExists(err.message),
            ProviderErrorKind::Terminal | ProviderErrorKind::StaleGeneration => ClientError::NotRunning(err.message),
            _ => ClientError::Provider(err),
        }
    }
}

/// Errors raised while starting or driving the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("activity queue closed")]
    QueueClosed,
}

impl RuntimeError {
    /// Store hiccups that a later attempt may get past.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Provider(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_details_roundtrip_through_history_json() {
        let err = ErrorDetails::ActivityExecution {
            activity: "ExtractThumbnail".into(),
            attempts: 4,
            message: "Failed to extract thumbnail".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"activity_execution\""));
        let back: ErrorDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.message(), "Failed to extract thumbnail");
        assert!(back.is_recoverable());
    }

    #[test]
    fn logic_errors_are_not_recoverable() {
        let err = ErrorDetails::logic("nondeterministic schedule");
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "orchestration logic error: nondeterministic schedule");
    }

    #[test]
    fn config_error_maps_to_configuration_details() {
        let details = ErrorDetails::from(&ConfigError::UnknownActivity("Missing".into()));
        assert_eq!(
            details,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnknownActivity,
                name: "Missing".into()
            }
        );
    }
}
