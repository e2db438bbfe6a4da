//! Job orchestration across the Setup, Run, and Extract phases.
//!
//! A [`Job`] is fingerprinted once when built. The [`Orchestrator`] skips
//! every phase whose outputs are verified for that fingerprint and
//! executes the rest, delegating Run to the configured
//! [`Strategy`](stagehand_engine::Strategy) and Setup/Extract to
//! [`PhaseHandler`]s.

pub mod error;
pub mod handler;
pub mod job;
pub mod orchestrator;

pub use error::PipelineError;
pub use handler::{NoopHandler, PhaseCall, PhaseHandler, ShellHandler};
pub use job::{Job, JobFile, PhaseCommand};
pub use orchestrator::{
    JobPlan, JobReport, Orchestrator, OrchestratorConfig, PhaseOutcome, PhasePlan, PhaseReport,
    RunOptions,
};
