//! Per-job phase sequencing with content-addressed skipping.
//!
//! For each job the orchestrator:
//! 1. Invalidates the metadata record when a forced recompute is requested.
//! 2. Loads the record, quarantining it if it cannot be parsed.
//! 3. Asks the [`DeliverableVerifier`] for every phase's status and picks
//!    the first phase that is not done. That phase and everything after it
//!    executes; the phases before it are skipped.
//! 4. Refuses to rerun a phase whose last attempt failed under the same
//!    fingerprint unless a rerun was requested.
//! 5. Runs each executing phase inside a profiler scope, delegating Run to
//!    the active [`Strategy`] and Setup/Extract to a [`PhaseHandler`].
//! 6. Verifies the phase's deliverables and only then records it complete.
//!
//! A cancelled phase writes no metadata and its partial deliverables are
//! deleted; a failed phase leaves a failure record behind.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stagehand_core::deliverable::{
    ArtifactProblem, DeliverableVerifier, PhaseStatus, StatusReason, Verdict,
};
use stagehand_core::error::CoreError;
use stagehand_core::fingerprint::Fingerprint;
use stagehand_core::metadata::{FailureRecord, JobMetadata, MetadataStore};
use stagehand_core::profiler::Profiler;
use stagehand_core::types::{Phase, Timestamp};
use stagehand_engine::strategy::DEFAULT_PROGRESS_INTERVAL;
use stagehand_engine::{ExecutionContext, ExecutionError, ExecutionStatus, PreparedJob, Strategy};
use stagehand_events::EventSender;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::handler::{NoopHandler, PhaseCall, PhaseHandler};
use crate::job::Job;

// ---------------------------------------------------------------------------
// Options and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Accept phases on deliverable presence alone, ignoring metadata.
    pub unsafe_fast_path: bool,
    /// Period of progress messages while a phase runs.
    pub progress_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            unsafe_fast_path: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Delete the job's metadata and recompute every phase.
    pub force_recompute: bool,
    /// Retry a phase whose last attempt failed under the same fingerprint.
    pub rerun_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// Already done; not executed.
    Skipped,
    Completed,
    Failed { message: String },
    Cancelled,
    /// An earlier phase stopped the job.
    NotReached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    #[serde(flatten)]
    pub outcome: PhaseOutcome,
}

/// What one invocation did to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub phases: Vec<PhaseReport>,
    /// Retries spent by the Run strategy.
    pub retry_count: u32,
}

impl JobReport {
    fn new(job: &Job) -> Self {
        Self {
            name: job.name().to_string(),
            fingerprint: job.fingerprints().job.clone(),
            phases: Vec::with_capacity(Phase::ALL.len()),
            retry_count: 0,
        }
    }

    fn push(&mut self, phase: Phase, outcome: PhaseOutcome) {
        self.phases.push(PhaseReport { phase, outcome });
    }

    /// Mark every phase after `phase` as not reached.
    fn stop_after(&mut self, phase: Phase) {
        for later in phase.downstream() {
            self.push(later, PhaseOutcome::NotReached);
        }
    }

    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }

    /// Phases that actually ran to completion.
    pub fn executed(&self) -> Vec<Phase> {
        self.phases
            .iter()
            .filter(|r| r.outcome == PhaseOutcome::Completed)
            .map(|r| r.phase)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.phases
            .iter()
            .all(|r| matches!(r.outcome, PhaseOutcome::Skipped | PhaseOutcome::Completed))
    }

    /// Turn a failed or cancelled run into the matching error.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        let stopped = self.phases.iter().find_map(|r| match &r.outcome {
            PhaseOutcome::Failed { message } => Some(PipelineError::PhaseFailed {
                phase: r.phase,
                fingerprint: self.fingerprint.clone(),
                message: message.clone(),
            }),
            PhaseOutcome::Cancelled => Some(PipelineError::Cancelled {
                phase: r.phase,
                fingerprint: self.fingerprint.clone(),
            }),
            _ => None,
        });
        match stopped {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhasePlan {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub reason: String,
    pub execute: bool,
}

/// Dry-run view of what [`Orchestrator::run`] would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPlan {
    pub name: String,
    pub fingerprint: Fingerprint,
    /// The metadata record exists but cannot be parsed.
    pub metadata_corrupt: bool,
    pub phases: Vec<PhasePlan>,
}

impl JobPlan {
    /// First phase that would execute, if any.
    pub fn start(&self) -> Option<Phase> {
        self.phases.iter().find(|p| p.execute).map(|p| p.phase)
    }
}

fn describe(reason: &StatusReason) -> String {
    match reason {
        StatusReason::NoRecord => "no metadata record".to_string(),
        StatusReason::Unverified => "not recorded as complete".to_string(),
        StatusReason::FingerprintChanged => "fingerprint changed".to_string(),
        StatusReason::Artifact(problem) => describe_problem(problem),
        StatusReason::Verified => "verified".to_string(),
        StatusReason::FastPath => "deliverables present (unsafe fast path)".to_string(),
    }
}

fn describe_problem(problem: &ArtifactProblem) -> String {
    match problem {
        ArtifactProblem::Missing(path) => format!("{} is missing", path.display()),
        ArtifactProblem::Invalid { path, reason } => {
            format!("{} is invalid: {reason}", path.display())
        }
        ArtifactProblem::Outdated { path, modified } => format!(
            "{} predates setup (modified {})",
            path.display(),
            modified.to_rfc3339()
        ),
    }
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// Verdict per phase and the first phase that must execute.
struct Assessment {
    verdicts: [Verdict; 3],
    start: Option<Phase>,
}

impl Assessment {
    fn new(job: &Job, metadata: Option<&JobMetadata>, fast_path: bool) -> Self {
        let verifier = DeliverableVerifier::new(job.deliverables(), job.fingerprints())
            .with_unsafe_fast_path(fast_path);
        let verdicts = Phase::ALL.map(|phase| verifier.status(phase, metadata));

        // An invalid artifact anywhere means the job's outputs cannot be
        // trusted; recompute everything.
        let start = if verdicts.iter().any(Verdict::is_corrupt) {
            Some(Phase::Setup)
        } else {
            Phase::ALL
                .into_iter()
                .find(|phase| !verdicts[phase.index()].is_done())
        };
        Self { verdicts, start }
    }

    fn verdict(&self, phase: Phase) -> &Verdict {
        &self.verdicts[phase.index()]
    }

    fn executes(&self, phase: Phase) -> bool {
        self.start.is_some_and(|start| phase >= start)
    }

    fn corrupt_phases(&self) -> impl Iterator<Item = Phase> + '_ {
        Phase::ALL
            .into_iter()
            .filter(|phase| self.verdict(*phase).is_corrupt())
    }
}

/// Terminal state of one executed phase.
enum PhaseRun {
    Completed,
    Failed(String),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs jobs phase by phase, skipping phases whose outputs are verified.
pub struct Orchestrator {
    strategy: Strategy,
    setup: Arc<dyn PhaseHandler>,
    extract: Arc<dyn PhaseHandler>,
    profiler: Profiler,
    events: EventSender,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// An orchestrator whose Setup and Extract phases have no work of
    /// their own. See [`with_handlers`](Self::with_handlers).
    pub fn new(strategy: Strategy, profiler: Profiler, events: EventSender) -> Self {
        Self {
            strategy,
            setup: Arc::new(NoopHandler),
            extract: Arc::new(NoopHandler),
            profiler,
            events,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_handlers(
        mut self,
        setup: Arc<dyn PhaseHandler>,
        extract: Arc<dyn PhaseHandler>,
    ) -> Self {
        self.setup = setup;
        self.extract = extract;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Report per-phase status and what a run would execute, without
    /// touching the filesystem.
    pub fn plan(&self, job: &Job, options: RunOptions) -> Result<JobPlan, PipelineError> {
        let (metadata, metadata_corrupt) = if options.force_recompute {
            (None, false)
        } else {
            match MetadataStore::load(job.job_dir()) {
                Ok(metadata) => (metadata, false),
                Err(CoreError::Corruption { .. }) => (None, true),
                Err(e) => return Err(e.into()),
            }
        };
        let fast_path = self.config.unsafe_fast_path && !options.force_recompute;
        let assessment = Assessment::new(job, metadata.as_ref(), fast_path);

        let phases = Phase::ALL
            .into_iter()
            .map(|phase| {
                let verdict = assessment.verdict(phase);
                PhasePlan {
                    phase,
                    status: verdict.status,
                    reason: describe(&verdict.reason),
                    execute: assessment.executes(phase),
                }
            })
            .collect();

        Ok(JobPlan {
            name: job.name().to_string(),
            fingerprint: job.fingerprints().job.clone(),
            metadata_corrupt,
            phases,
        })
    }

    /// Bring the job's outputs up to date.
    ///
    /// Phase failures and cancellation are reported in the returned
    /// [`JobReport`]; `Err` is reserved for problems that stop the job
    /// before any phase runs or that leave its metadata unwritable.
    pub async fn run(
        &self,
        job: &Job,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<JobReport, PipelineError> {
        let job_dir = job.job_dir();
        let fingerprints = job.fingerprints();
        tracing::info!(
            job = job.name(),
            fingerprint = fingerprints.job.short(),
            force = options.force_recompute,
            "Job starting",
        );
        fs::create_dir_all(job_dir).map_err(|e| CoreError::io(job_dir, e))?;

        if options.force_recompute && MetadataStore::remove(job_dir)? {
            tracing::info!(job = job.name(), "Metadata invalidated for forced recompute");
        }

        let mut metadata = self.load_metadata(job)?;
        if options.rerun_failed {
            if let Some(record) = metadata.as_mut().filter(|m| m.last_failure.is_some()) {
                MetadataStore::clear_failure(job_dir)?;
                record.last_failure = None;
            }
        }

        let fast_path = self.config.unsafe_fast_path && !options.force_recompute;
        let assessment = Assessment::new(job, metadata.as_ref(), fast_path);

        if let (Some(start), Some(record)) = (assessment.start, metadata.as_ref()) {
            for phase in start.and_downstream() {
                if let Some(failure) = record.failure_for(phase, fingerprints.phase(phase)) {
                    return Err(PipelineError::PreviouslyFailed {
                        phase,
                        fingerprint: fingerprints.job.clone(),
                        message: failure.message.clone(),
                    });
                }
            }
        }

        for phase in assessment.corrupt_phases() {
            let moved = job.deliverables().quarantine_invalid(phase)?;
            tracing::warn!(
                job = job.name(),
                %phase,
                quarantined = moved.len(),
                "Invalid deliverables quarantined, recomputing job",
            );
            self.events.warn(format!(
                "{phase}: {}; recomputing the whole job",
                describe(&assessment.verdict(phase).reason)
            ));
        }

        let mut ctx = ExecutionContext::new(self.profiler.clone(), self.events.clone(), cancel.clone());
        ctx.progress_interval = self.config.progress_interval;

        let mut report = JobReport::new(job);
        let mut setup_timestamp = metadata.as_ref().map(|m| m.setup_timestamp);
        self.profiler.begin_run();

        for phase in Phase::ALL {
            if !assessment.executes(phase) {
                let verdict = assessment.verdict(phase);
                if verdict.reason == StatusReason::FastPath {
                    setup_timestamp = Some(self.adopt(job, phase, metadata.as_ref())?);
                    metadata = MetadataStore::load(job_dir)?;
                }
                self.profiler.skip_phase(phase);
                tracing::info!(job = job.name(), %phase, reason = %describe(&verdict.reason), "Phase up to date");
                self.events.info(format!("{phase} up to date, skipping"));
                report.push(phase, PhaseOutcome::Skipped);
                continue;
            }

            if cancel.is_cancelled() {
                tracing::info!(job = job.name(), %phase, "Cancelled before phase");
                report.push(phase, PhaseOutcome::Cancelled);
                report.stop_after(phase);
                return Ok(report);
            }

            // Downstream flags of a redone phase describe outputs derived
            // from the old ones. A redone Setup replaces the whole record
            // once it verifies.
            if phase != Phase::Setup && assessment.start == Some(phase) {
                MetadataStore::invalidate(job_dir, phase)?;
            }
            let not_before = match phase {
                Phase::Setup => Utc::now(),
                _ => setup_timestamp.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            };

            let (run, retry_count) = self.execute_phase(job, phase, &ctx, not_before).await?;
            report.retry_count += retry_count;

            match run {
                PhaseRun::Completed => {
                    if phase == Phase::Setup {
                        setup_timestamp = Some(not_before);
                    }
                    report.push(phase, PhaseOutcome::Completed);
                }
                PhaseRun::Cancelled => {
                    job.deliverables().discard(phase)?;
                    tracing::info!(job = job.name(), %phase, "Phase cancelled, partial output discarded");
                    self.events.warn(format!("{phase} cancelled"));
                    report.push(phase, PhaseOutcome::Cancelled);
                    report.stop_after(phase);
                    return Ok(report);
                }
                PhaseRun::Failed(message) => {
                    MetadataStore::record_failure(
                        job_dir,
                        fingerprints,
                        FailureRecord {
                            phase,
                            fingerprint: fingerprints.phase(phase).clone(),
                            message: message.clone(),
                            failed_at: Utc::now(),
                        },
                    )?;
                    tracing::error!(
                        job = job.name(),
                        %phase,
                        fingerprint = fingerprints.phase(phase).short(),
                        error = %message,
                        "Phase failed",
                    );
                    self.events.error(format!("{phase} failed: {message}"));
                    report.push(phase, PhaseOutcome::Failed { message });
                    report.stop_after(phase);
                    return Ok(report);
                }
            }
        }

        self.events.progress(self.profiler.finish_run());
        tracing::info!(
            job = job.name(),
            executed = ?report.executed(),
            retry_count = report.retry_count,
            "Job finished",
        );
        Ok(report)
    }

    /// Load the metadata record, quarantining it if corrupt.
    fn load_metadata(&self, job: &Job) -> Result<Option<JobMetadata>, PipelineError> {
        match MetadataStore::load(job.job_dir()) {
            Ok(metadata) => Ok(metadata),
            Err(CoreError::Corruption { path, reason }) => {
                let moved = MetadataStore::quarantine(job.job_dir())?;
                tracing::warn!(
                    job = job.name(),
                    path = %path.display(),
                    quarantined = ?moved,
                    error = %reason,
                    "Corrupt metadata quarantined",
                );
                self.events
                    .warn(format!("corrupt metadata quarantined ({reason}); recomputing the whole job"));
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a phase accepted by the unsafe fast path so later phases can
    /// be recorded on top of it. Returns the setup timestamp to use.
    fn adopt(
        &self,
        job: &Job,
        phase: Phase,
        metadata: Option<&JobMetadata>,
    ) -> Result<Timestamp, PipelineError> {
        let fingerprints = job.fingerprints();
        if let Some(record) = metadata.filter(|m| {
            m.is_done(phase) && m.phase_fingerprint(phase) == Some(fingerprints.phase(phase))
        }) {
            return Ok(record.setup_timestamp);
        }
        tracing::warn!(job = job.name(), %phase, "Adopting unverified outputs (unsafe fast path)");
        let record = match phase {
            // Provenance of adopted outputs is unknown; anything counts as fresh.
            Phase::Setup => {
                MetadataStore::record_setup(job.job_dir(), fingerprints, DateTime::<Utc>::UNIX_EPOCH)?
            }
            _ => MetadataStore::update(job.job_dir(), phase, fingerprints)?,
        };
        Ok(record.setup_timestamp)
    }

    async fn execute_phase(
        &self,
        job: &Job,
        phase: Phase,
        ctx: &ExecutionContext,
        not_before: Timestamp,
    ) -> Result<(PhaseRun, u32), PipelineError> {
        let fingerprints = job.fingerprints();
        let scope = self.profiler.phase(phase);
        ctx.report_progress();
        self.events.info(format!("{phase} starting"));
        tracing::info!(
            job = job.name(),
            %phase,
            fingerprint = fingerprints.phase(phase).short(),
            "Phase starting",
        );

        let (result, retry_count) = match phase {
            Phase::Run => {
                let prepared = PreparedJob {
                    name: job.name(),
                    job_dir: job.job_dir(),
                    descriptor: job.descriptor(),
                    fingerprint: fingerprints.phase(Phase::Run),
                    output: job.deliverables().primary_output(),
                };
                let result = self.strategy.execute(&prepared, ctx).await;
                let outcome = match result.status {
                    ExecutionStatus::Success => Ok(()),
                    ExecutionStatus::Cancelled => Err(ExecutionError::Cancelled),
                    ExecutionStatus::Failed => Err(ExecutionError::fatal(
                        result.error.unwrap_or_else(|| "run failed".to_string()),
                    )),
                };
                (outcome, result.retry_count)
            }
            Phase::Setup | Phase::Extract => {
                let handler = if phase == Phase::Setup {
                    &self.setup
                } else {
                    &self.extract
                };
                let call = PhaseCall {
                    phase,
                    name: job.name(),
                    job_dir: job.job_dir(),
                    descriptor: job.descriptor(),
                    fingerprint: fingerprints.phase(phase),
                    deliverables: job.deliverables().for_phase(phase),
                };
                (handler.handle(&call, ctx).await, 0)
            }
        };

        match result {
            Ok(()) => {}
            Err(ExecutionError::Cancelled) => return Ok((PhaseRun::Cancelled, retry_count)),
            Err(e) => return Ok((PhaseRun::Failed(e.to_string()), retry_count)),
        }

        let verifier = DeliverableVerifier::new(job.deliverables(), fingerprints);
        if let Err(problem) = verifier.verify_fresh(phase, not_before) {
            return Ok((
                PhaseRun::Failed(format!(
                    "deliverables not produced: {}",
                    describe_problem(&problem)
                )),
                retry_count,
            ));
        }

        scope.complete();
        match phase {
            Phase::Setup => {
                MetadataStore::record_setup(job.job_dir(), fingerprints, not_before)?;
            }
            _ => {
                MetadataStore::update(job.job_dir(), phase, fingerprints)?;
            }
        }
        ctx.report_progress();
        self.events.info(format!("{phase} complete"));
        Ok((PhaseRun::Completed, retry_count))
    }
}
