use stagehand_core::error::CoreError;

/// Why one attempt at external work did not succeed.
///
/// The split between [`Transient`](Self::Transient) and
/// [`Fatal`](Self::Fatal) drives [`RetryPolicy`](crate::retry::RetryPolicy):
/// only transient errors are retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Network hiccup, queue congestion, 5xx. Worth another attempt.
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<CoreError> for ExecutionError {
    fn from(e: CoreError) -> Self {
        Self::Fatal(e.to_string())
    }
}

/// Errors raised while building a strategy from configuration.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid engine configuration: {0}")]
    Config(String),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}
