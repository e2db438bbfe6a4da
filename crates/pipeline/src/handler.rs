//! Collaborators that perform the Setup and Extract phases.
//!
//! The Run phase belongs to the active [`Strategy`](stagehand_engine::Strategy);
//! the phases around it are delegated to a [`PhaseHandler`]. The worker
//! binary uses [`ShellHandler`] with commands declared in the job file.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use stagehand_core::deliverable::ResolvedDeliverable;
use stagehand_core::descriptor::JobDescriptor;
use stagehand_core::fingerprint::Fingerprint;
use stagehand_core::types::Phase;
use stagehand_engine::{run_reporting, ExecutionContext, ExecutionError, ProcessError, ProcessSpec};

/// One invocation of a Setup or Extract collaborator.
#[derive(Debug, Clone, Copy)]
pub struct PhaseCall<'a> {
    pub phase: Phase,
    pub name: &'a str,
    pub job_dir: &'a Path,
    pub descriptor: &'a JobDescriptor,
    /// Fingerprint of `phase`.
    pub fingerprint: &'a Fingerprint,
    /// Artifacts the phase is expected to produce.
    pub deliverables: &'a [ResolvedDeliverable],
}

/// Performs a non-Run phase.
///
/// Implementations report progress through `ctx` and should return
/// [`ExecutionError::Cancelled`] promptly once `ctx.cancel` fires.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn handle(&self, call: &PhaseCall<'_>, ctx: &ExecutionContext) -> Result<(), ExecutionError>;
}

/// A phase with no work of its own; its deliverables still get verified.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl PhaseHandler for NoopHandler {
    async fn handle(&self, call: &PhaseCall<'_>, _ctx: &ExecutionContext) -> Result<(), ExecutionError> {
        tracing::debug!(job = call.name, phase = %call.phase, "No command for phase");
        Ok(())
    }
}

/// Runs a phase as `sh -c <command>` inside the job directory.
///
/// The descriptor is piped to stdin as JSON. The command sees
/// `STAGEHAND_PHASE`, `STAGEHAND_JOB_NAME`, `STAGEHAND_JOB_DIR`,
/// `STAGEHAND_FINGERPRINT`, and `STAGEHAND_DELIVERABLES` (paths separated
/// by newlines). Progress markers in its output are honoured the same way
/// as for the local Run strategy.
#[derive(Debug, Clone)]
pub struct ShellHandler {
    command: String,
    timeout: Option<Duration>,
}

impl ShellHandler {
    pub fn new(command: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn spec(&self, call: &PhaseCall<'_>) -> ProcessSpec {
        let deliverables = call
            .deliverables
            .iter()
            .map(|d| d.path.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");

        ProcessSpec::shell(&self.command)
            .working_dir(call.job_dir)
            .timeout(self.timeout)
            .env("STAGEHAND_PHASE", call.phase.as_str())
            .env("STAGEHAND_JOB_NAME", call.name)
            .env("STAGEHAND_JOB_DIR", call.job_dir.display().to_string())
            .env("STAGEHAND_FINGERPRINT", call.fingerprint.as_str())
            .env("STAGEHAND_DELIVERABLES", deliverables)
            .stdin(call.descriptor.to_value().to_string().into_bytes())
    }
}

#[async_trait]
impl PhaseHandler for ShellHandler {
    async fn handle(&self, call: &PhaseCall<'_>, ctx: &ExecutionContext) -> Result<(), ExecutionError> {
        match run_reporting(&self.spec(call), ctx, call.name).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(ExecutionError::fatal(format!(
                "{} command exited with code {}:\n{}",
                call.phase,
                output.exit_code,
                output.tail_text()
            ))),
            Err(ProcessError::Cancelled) => Err(ExecutionError::Cancelled),
            Err(ProcessError::Timeout { elapsed_ms, tail }) => Err(ExecutionError::fatal(format!(
                "{} command timed out after {elapsed_ms}ms:\n{}",
                call.phase,
                tail.join("\n")
            ))),
            Err(e) => Err(ExecutionError::fatal(e.to_string())),
        }
    }
}
