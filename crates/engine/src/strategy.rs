//! The closed set of Run-phase backends and the types they share.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_core::descriptor::JobDescriptor;
use stagehand_core::fingerprint::Fingerprint;
use stagehand_core::profiler::Profiler;
use stagehand_events::EventSender;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchConfig, BatchStrategy};
use crate::error::{EngineError, ExecutionError};
use crate::local::{LocalConfig, LocalProcessStrategy};
use crate::remote::{RemoteConfig, RemoteSyncStrategy};

/// Default period between progress messages while waiting on opaque work.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Everything a strategy needs to know about the job it runs.
#[derive(Debug, Clone, Copy)]
pub struct PreparedJob<'a> {
    pub name: &'a str,
    pub job_dir: &'a Path,
    pub descriptor: &'a JobDescriptor,
    /// Fingerprint of the Run phase.
    pub fingerprint: &'a Fingerprint,
    /// Where the Run phase's primary artifact must end up.
    pub output: &'a Path,
}

/// Collaborators a strategy reports through while executing.
#[derive(Clone)]
pub struct ExecutionContext {
    pub profiler: Profiler,
    pub events: EventSender,
    pub cancel: CancellationToken,
    pub progress_interval: Duration,
}

impl ExecutionContext {
    pub fn new(profiler: Profiler, events: EventSender, cancel: CancellationToken) -> Self {
        Self {
            profiler,
            events,
            cancel,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Push the profiler's current progress onto the event channel.
    pub fn report_progress(&self) {
        self.events.progress(self.profiler.snapshot());
    }

    /// Await `fut`, emitting progress every `progress_interval` meanwhile.
    pub async fn with_progress<F: Future>(&self, fut: F) -> F::Output {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(self.progress_interval);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => self.report_progress(),
            }
        }
    }
}

/// Store a fetched result as the job's primary artifact.
pub(crate) fn write_output(job: &PreparedJob<'_>, bytes: &[u8]) -> Result<(), ExecutionError> {
    stagehand_core::metadata::write_atomic(job.output, bytes)?;
    tracing::debug!(
        job = job.name,
        path = %job.output.display(),
        bytes = bytes.len(),
        "Run output written",
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Cancelled,
}

/// Terminal outcome of one Run-phase execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub error: Option<String>,
    /// Retries performed (attempts minus one) across the execution.
    pub retry_count: u32,
}

impl ExecutionResult {
    pub fn success(retry_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Success,
            error: None,
            retry_count,
        }
    }

    pub fn failed(error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(error.into()),
            retry_count,
        }
    }

    pub fn cancelled(retry_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            error: None,
            retry_count,
        }
    }

    /// Map a terminal error to a result.
    pub fn from_error(error: ExecutionError, retry_count: u32) -> Self {
        match error {
            ExecutionError::Cancelled => Self::cancelled(retry_count),
            other => Self::failed(other.to_string(), retry_count),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Which backend performs the Run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Local,
    Remote,
    Batch,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "batch" => Ok(Self::Batch),
            other => Err(format!("unknown strategy '{other}' (expected local, remote, or batch)")),
        }
    }
}

/// Resolved configuration for exactly one strategy.
#[derive(Debug, Clone)]
pub enum StrategyConfig {
    Local(LocalConfig),
    Remote(RemoteConfig),
    Batch(BatchConfig),
}

/// The active Run-phase backend, selected once at startup.
pub enum Strategy {
    Local(LocalProcessStrategy),
    Remote(RemoteSyncStrategy),
    Batch(BatchStrategy),
}

impl Strategy {
    /// Build the strategy with its HTTP implementation where applicable.
    pub fn from_config(config: StrategyConfig) -> Result<Self, EngineError> {
        Ok(match config {
            StrategyConfig::Local(config) => Self::Local(LocalProcessStrategy::new(config)?),
            StrategyConfig::Remote(config) => Self::Remote(RemoteSyncStrategy::over_http(config)?),
            StrategyConfig::Batch(config) => Self::Batch(BatchStrategy::over_http(config)?),
        })
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Local(_) => StrategyKind::Local,
            Self::Remote(_) => StrategyKind::Remote,
            Self::Batch(_) => StrategyKind::Batch,
        }
    }

    /// Perform the Run phase. Never panics on backend failure; every
    /// outcome is folded into the returned [`ExecutionResult`].
    pub async fn execute(&self, job: &PreparedJob<'_>, ctx: &ExecutionContext) -> ExecutionResult {
        tracing::info!(
            job = job.name,
            strategy = %self.kind(),
            fingerprint = job.fingerprint.short(),
            "Run phase starting",
        );
        let result = match self {
            Self::Local(strategy) => strategy.execute(job, ctx).await,
            Self::Remote(strategy) => strategy.execute(job, ctx).await,
            Self::Batch(strategy) => strategy.execute(job, ctx).await,
        };
        tracing::info!(
            job = job.name,
            strategy = %self.kind(),
            status = ?result.status,
            retry_count = result.retry_count,
            "Run phase finished",
        );
        result
    }
}
