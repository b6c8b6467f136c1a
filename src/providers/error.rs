/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// No instance with that id.
    NotFound,
    /// `create_instance` on an id that is taken.
    AlreadyExists,
    /// The write targeted a generation that was already continued.
    StaleGeneration,
    /// The generation already holds a terminal event.
    Terminal,
    /// The event does not fit the history (unknown correlation, misplaced start).
    InvalidEvent,
    /// Backend failure.
    Storage,
}

/// Provider-specific error with retry classification.
///
/// The runtime retries `retryable` errors with back-off; everything else is
/// reported to the caller immediately. `Terminal` and `StaleGeneration` are
/// expected under races (late activity results, timers of a terminated
/// instance) and are logged at debug level by the runtime.
///
/// ```rust
/// use duraflow::providers::ProviderError;
///
/// let busy = ProviderError::retryable("append", "database is locked");
/// assert!(busy.is_retryable());
/// let gone = ProviderError::not_found("read", "inst-1");
/// assert!(!gone.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub operation: String,
    pub message: String,
    pub retryable: bool,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    fn new(operation: impl Into<String>, message: impl Into<String>, retryable: bool, kind: ProviderErrorKind) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable,
            kind,
        }
    }

    /// Transient failure, e.g. a busy database or a dropped connection.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, true, ProviderErrorKind::Storage)
    }

    /// Failure that will not go away on retry.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, false, ProviderErrorKind::Storage)
    }

    pub fn not_found(operation: impl Into<String>, instance: impl Into<String>) -> Self {
        Self::new(operation, instance, false, ProviderErrorKind::NotFound)
    }

    pub fn already_exists(operation: impl Into<String>, instance: impl Into<String>) -> Self {
        Self::new(operation, instance, false, ProviderErrorKind::AlreadyExists)
    }

    pub fn stale_generation(operation: impl Into<String>, instance: impl Into<String>) -> Self {
        Self::new(operation, instance, false, ProviderErrorKind::StaleGeneration)
    }

    pub fn terminal(operation: impl Into<String>, instance: impl Into<String>) -> Self {
        Self::new(operation, instance, false, ProviderErrorKind::Terminal)
    }

    pub fn invalid_event(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, false, ProviderErrorKind::InvalidEvent)
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The write lost a race with termination, completion or continuation.
    pub fn is_closed_generation(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Terminal | ProviderErrorKind::StaleGeneration)
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ProviderErrorKind::NotFound => write!(f, "{}: instance '{}' not found", self.operation, self.message),
            ProviderErrorKind::AlreadyExists => {
                write!(f, "{}: instance '{}' already exists", self.operation, self.message)
            }
            ProviderErrorKind::StaleGeneration => write!(
                f,
                "{}: instance '{}' has moved to a newer generation",
                self.operation, self.message
            ),
            ProviderErrorKind::Terminal => {
                write!(f, "{}: instance '{}' is no longer running", self.operation, self.message)
            }
            ProviderErrorKind::InvalidEvent | ProviderErrorKind::Storage => {
                if self.retryable {
                    write!(f, "{} (retryable): {}", self.operation, self.message)
                } else {
                    write!(f, "{}: {}", self.operation, self.message)
                }
            }
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<sqlx::Error> for ProviderError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        let transient = matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
            || message.contains("database is locked")
            || message.contains("busy");
        if transient {
            ProviderError::retryable("sqlite", message)
        } else {
            ProviderError::permanent("sqlite", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_are_flagged() {
        let err = ProviderError::retryable("append", "Database is busy");
        assert!(err.is_retryable());
        assert_eq!(err.kind, ProviderErrorKind::Storage);
        assert_eq!(err.to_string(), "append (retryable): Database is busy");
    }

    #[test]
    fn closed_generations_are_recognized() {
        assert!(ProviderError::terminal("append", "i").is_closed_generation());
        assert!(ProviderError::stale_generation("append", "i").is_closed_generation());
        assert!(!ProviderError::not_found("read", "i").is_closed_generation());
    }

    #[test]
    fn display_names_the_instance() {
        let err = ProviderError::not_found("read", "inst-7");
        assert_eq!(err.to_string(), "read: instance 'inst-7' not found");
    }
}
