//! Run-phase execution backends.
//!
//! [`Strategy`] is the closed set of ways to perform a job's Run phase:
//! a local child process, a blocking remote service call, or an
//! asynchronous cloud batch job. The remote backends sit behind the
//! [`RemoteEngine`] and [`BatchBackend`] traits and share the bounded
//! [`RetryPolicy`] and [`PollingLoop`].

pub mod batch;
pub mod error;
pub mod http;
pub mod local;
pub mod polling;
pub mod process;
pub mod remote;
pub mod retry;
pub mod strategy;

pub use batch::{BatchBackend, BatchConfig, BatchRequest, BatchStrategy, HttpBatchBackend};
pub use error::{EngineError, ExecutionError};
pub use local::{run_reporting, LocalConfig, LocalProcessStrategy};
pub use polling::{BatchState, PollOutcome, PollingLoop};
pub use process::{run_process, ProcessError, ProcessOutput, ProcessSpec, Stream};
pub use remote::{
    HttpRemoteEngine, RemoteConfig, RemoteEngine, RemoteRunRequest, RemoteSyncStrategy,
    RemoteTarget,
};
pub use retry::{Backoff, Retried, RetryPolicy};
pub use strategy::{
    ExecutionContext, ExecutionResult, ExecutionStatus, PreparedJob, Strategy, StrategyConfig,
    StrategyKind,
};
