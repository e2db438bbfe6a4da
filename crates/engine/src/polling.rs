//! Bounded status polling for asynchronously executing remote jobs.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;

/// Lifecycle of a submitted batch job as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }
}

/// How a polling loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Terminal(BatchState),
    /// The poll count or time budget ran out before a terminal state.
    Exhausted { polls: u32, elapsed: Duration },
    Cancelled,
    /// A poll failed with a non-transient error.
    Failed(ExecutionError),
}

/// Fixed-interval poller with a poll-count and wall-clock budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingLoop {
    pub interval: Duration,
    pub max_polls: u32,
    pub max_elapsed: Duration,
}

impl Default for PollingLoop {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_polls: 360,
            max_elapsed: Duration::from_secs(60 * 60),
        }
    }
}

impl PollingLoop {
    /// Poll until a terminal state, budget exhaustion, or cancellation.
    ///
    /// The first poll happens immediately. A transient poll error consumes
    /// a poll and the loop carries on.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut poll: F) -> PollOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<BatchState, ExecutionError>>,
    {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polls = 0u32;

        loop {
            if cancel.is_cancelled() {
                return PollOutcome::Cancelled;
            }
            if polls >= self.max_polls || started.elapsed() >= self.max_elapsed {
                return PollOutcome::Exhausted {
                    polls,
                    elapsed: started.elapsed(),
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = ticker.tick() => {}
            }

            polls += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                result = poll(polls) => result,
            };

            match result {
                Ok(state) if state.is_terminal() => return PollOutcome::Terminal(state),
                Ok(state) => {
                    tracing::debug!(poll = polls, ?state, "Batch job not finished");
                }
                Err(ExecutionError::Cancelled) => return PollOutcome::Cancelled,
                Err(e) if e.is_transient() => {
                    tracing::warn!(poll = polls, error = %e, "Status poll failed");
                }
                Err(e) => return PollOutcome::Failed(e),
            }
        }
    }
}
