use std::fmt;

use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// One of the three strictly ordered phases of a job.
///
/// Each phase depends on the output of the phase before it: Run needs
/// Setup's output, Extract needs Run's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Run,
    Extract,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Setup, Phase::Run, Phase::Extract];

    /// Zero-based position in execution order.
    pub fn index(self) -> usize {
        match self {
            Phase::Setup => 0,
            Phase::Run => 1,
            Phase::Extract => 2,
        }
    }

    /// String representation used in metadata, timing keys, and messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Run => "run",
            Phase::Extract => "extract",
        }
    }

    /// This phase followed by every phase that depends on it.
    pub fn and_downstream(self) -> impl Iterator<Item = Phase> {
        Self::ALL.into_iter().skip(self.index())
    }

    /// Phases that execute after this one.
    pub fn downstream(self) -> impl Iterator<Item = Phase> {
        Self::ALL.into_iter().skip(self.index() + 1)
    }

    /// The phase this one depends on, if any.
    pub fn upstream(self) -> Option<Phase> {
        match self {
            Phase::Setup => None,
            Phase::Run => Some(Phase::Setup),
            Phase::Extract => Some(Phase::Run),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
