use stagehand_core::error::CoreError;
use stagehand_core::fingerprint::Fingerprint;
use stagehand_core::types::Phase;

/// Errors that stop a job before or while its phases run.
///
/// Every variant raised for a concrete phase names the phase and the
/// fingerprint it ran under.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed job file, descriptor, or deliverable declaration.
    #[error("Invalid job: {0}")]
    Validation(String),

    /// The phase failed on an earlier invocation under the same
    /// fingerprint and no rerun was requested.
    #[error(
        "{phase} previously failed for fingerprint {fingerprint}: {message} \
         (rerun with --rerun-failed to retry)"
    )]
    PreviouslyFailed {
        phase: Phase,
        fingerprint: Fingerprint,
        message: String,
    },

    #[error("{phase} failed for fingerprint {fingerprint}: {message}")]
    PhaseFailed {
        phase: Phase,
        fingerprint: Fingerprint,
        message: String,
    },

    #[error("{phase} cancelled for fingerprint {fingerprint}")]
    Cancelled { phase: Phase, fingerprint: Fingerprint },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl PipelineError {
    /// The phase the error is attributed to, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::PreviouslyFailed { phase, .. }
            | Self::PhaseFailed { phase, .. }
            | Self::Cancelled { phase, .. } => Some(*phase),
            Self::Validation(_) | Self::Core(_) => None,
        }
    }
}
