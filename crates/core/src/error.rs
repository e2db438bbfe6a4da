use std::path::PathBuf;

/// Errors raised by the core stores and verifiers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed job descriptor or deliverable declaration. Fatal, never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A metadata record or deliverable exists but cannot be read or parsed.
    ///
    /// The caller quarantines the artifact and recomputes the whole job.
    #[error("Corrupt artifact at {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Wrap an I/O error together with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
