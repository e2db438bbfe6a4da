//! Phase skipping, cascading, and recovery of the orchestrator against an
//! in-memory Run backend and file-writing Setup/Extract handlers.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::{json, Value};
use stagehand_core::deliverable::{Deliverable, DeliverableSet, PhaseStatus, Validity};
use stagehand_core::descriptor::JobDescriptor;
use stagehand_core::estimation::PhaseWeights;
use stagehand_core::fingerprint::{FingerprintScope, Fingerprinter, PhaseScopes};
use stagehand_core::metadata::{MetadataStore, METADATA_DIR};
use stagehand_core::profiler::Profiler;
use stagehand_core::types::Phase;
use stagehand_engine::{
    Backoff, ExecutionContext, ExecutionError, RemoteConfig, RemoteEngine, RemoteRunRequest,
    RemoteSyncStrategy, RemoteTarget, RetryPolicy, Strategy,
};
use stagehand_events::{channel, EventReceiver, JobEvent};
use stagehand_pipeline::{
    Job, JobReport, Orchestrator, OrchestratorConfig, PhaseCall, PhaseHandler, PhaseOutcome,
    PipelineError, RunOptions,
};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Remote engine that counts runs and can be told to misbehave.
#[derive(Default)]
struct CountingEngine {
    runs: AtomicU32,
    fatal_failures: AtomicU32,
    transient_failures: AtomicU32,
    hang: AtomicBool,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteEngine for CountingEngine {
    async fn list_targets(&self) -> Result<Vec<RemoteTarget>, ExecutionError> {
        Ok(vec![RemoteTarget::new("cluster-a", false)])
    }

    async fn run(&self, _request: &RemoteRunRequest) -> Result<Vec<u8>, ExecutionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        if take_one(&self.fatal_failures) {
            return Err(ExecutionError::fatal("solver diverged"));
        }
        if take_one(&self.transient_failures) {
            return Err(ExecutionError::transient("queue congested"));
        }
        Ok(b"result".to_vec())
    }
}

/// Writes every deliverable of its phase, optionally waiting for
/// cancellation after writing partial output.
struct WriteDeliverables {
    calls: AtomicU32,
    content: &'static str,
    block: AtomicBool,
}

impl WriteDeliverables {
    fn new(content: &'static str) -> Self {
        Self {
            calls: AtomicU32::new(0),
            content,
            block: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PhaseHandler for WriteDeliverables {
    async fn handle(&self, call: &PhaseCall<'_>, ctx: &ExecutionContext) -> Result<(), ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for deliverable in call.deliverables {
            if let Some(parent) = deliverable.path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&deliverable.path, self.content).unwrap();
        }
        if self.block.load(Ordering::SeqCst) {
            ctx.cancel.cancelled().await;
            return Err(ExecutionError::Cancelled);
        }
        Ok(())
    }
}

struct Harness {
    dir: tempfile::TempDir,
    engine: Arc<CountingEngine>,
    setup: Arc<WriteDeliverables>,
    extract: Arc<WriteDeliverables>,
    events: EventReceiver,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(OrchestratorConfig {
            progress_interval: Duration::from_millis(10),
            ..Default::default()
        })
    }

    fn with_config(config: OrchestratorConfig) -> Self {
        let engine = Arc::new(CountingEngine::default());
        let setup = Arc::new(WriteDeliverables::new("mesh"));
        let extract = Arc::new(WriteDeliverables::new(r#"{"max_stress": 1.5}"#));
        let (tx, events) = channel(4096);

        let strategy = Strategy::Remote(RemoteSyncStrategy::new(
            engine.clone(),
            RemoteConfig {
                base_url: "http://remote.invalid".to_string(),
                retry: RetryPolicy {
                    max_retries: 3,
                    backoff: Backoff::Fixed(Duration::from_millis(1)),
                },
                ..Default::default()
            },
        ));
        let orchestrator = Orchestrator::new(strategy, Profiler::new(PhaseWeights::default()), tx)
            .with_handlers(setup.clone(), extract.clone())
            .with_config(config);

        Self {
            dir: tempfile::tempdir().unwrap(),
            engine,
            setup,
            extract,
            events,
            orchestrator,
        }
    }

    /// Setup is fingerprinted on `case` only; `threads` never counts.
    fn job(&self, params: Value) -> Job {
        let deliverables = DeliverableSet {
            setup: vec![Deliverable::new("mesh/{case}.txt", Validity::NonEmpty)],
            run: Deliverable::new("result.bin", Validity::NonEmpty),
            extract: vec![Deliverable::new("summary.json", Validity::Json)],
        };
        let fingerprinter = Fingerprinter::new(
            FingerprintScope::excluding(["threads"]),
            PhaseScopes {
                setup: Some(FingerprintScope::only(["case"])),
                ..Default::default()
            },
        );
        Job::new(
            "beam",
            self.dir.path().join("beam"),
            JobDescriptor::from_value(params).unwrap(),
            &fingerprinter,
            &deliverables,
        )
        .unwrap()
    }

    async fn run(&self, job: &Job, options: RunOptions) -> Result<JobReport, PipelineError> {
        self.orchestrator
            .run(job, options, &CancellationToken::new())
            .await
    }

    /// Invocation counts of (Setup, Run, Extract).
    fn calls(&self) -> (u32, u32, u32) {
        (
            self.setup.calls.load(Ordering::SeqCst),
            self.engine.runs.load(Ordering::SeqCst),
            self.extract.calls.load(Ordering::SeqCst),
        )
    }
}

fn params() -> Value {
    json!({"case": "cantilever", "load": 1200, "threads": 8})
}

fn outcomes(report: &JobReport) -> Vec<PhaseOutcome> {
    report.phases.iter().map(|r| r.outcome.clone()).collect()
}

fn set_mtime(path: &Path, secs: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

// ---------------------------------------------------------------------------
// Skipping and cascading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_invocation_skips_everything_and_leaves_metadata_untouched() {
    let h = Harness::new();
    let job = h.job(params());

    let first = h.run(&job, RunOptions::default()).await.unwrap();
    assert!(first.is_success());
    assert_eq!(first.executed(), Phase::ALL.to_vec());
    let metadata_path = MetadataStore::path(job.job_dir());
    let before = fs::read(&metadata_path).unwrap();

    let second = h.run(&job, RunOptions::default()).await.unwrap();
    assert_eq!(outcomes(&second), vec![PhaseOutcome::Skipped; 3]);
    assert_eq!(h.calls(), (1, 1, 1));
    assert_eq!(fs::read(&metadata_path).unwrap(), before);
    assert_eq!(fs::read(job.deliverables().primary_output()).unwrap(), b"result");
}

#[tokio::test]
async fn deleted_run_output_reruns_run_and_extract_only() {
    let h = Harness::new();
    let job = h.job(params());
    h.run(&job, RunOptions::default()).await.unwrap();

    fs::remove_file(job.deliverables().primary_output()).unwrap();
    let report = h.run(&job, RunOptions::default()).await.unwrap();

    assert_eq!(
        outcomes(&report),
        vec![PhaseOutcome::Skipped, PhaseOutcome::Completed, PhaseOutcome::Completed]
    );
    assert_eq!(h.calls(), (1, 2, 2));
    let metadata = MetadataStore::load(job.job_dir()).unwrap().unwrap();
    assert!(metadata.setup_done && metadata.run_done && metadata.extract_done);
}

#[tokio::test]
async fn run_output_older_than_setup_is_stale() {
    let h = Harness::new();
    let job = h.job(params());
    h.run(&job, RunOptions::default()).await.unwrap();

    // Setup ran "now"; the Run artifact claims to predate it.
    set_mtime(job.deliverables().primary_output(), 90);
    let plan = h.orchestrator.plan(&job, RunOptions::default()).unwrap();
    assert_eq!(plan.phases[1].status, PhaseStatus::Stale);
    assert!(plan.phases[1].reason.contains("predates setup"));

    h.run(&job, RunOptions::default()).await.unwrap();
    assert_eq!(h.calls(), (1, 2, 2));
}

#[tokio::test]
async fn parameter_change_cascades_from_first_affected_phase() {
    let h = Harness::new();
    h.run(&h.job(params()), RunOptions::default()).await.unwrap();

    // `load` is outside the Setup scope: Setup stays valid.
    let changed = h.job(json!({"case": "cantilever", "load": 1500, "threads": 8}));
    let report = h.run(&changed, RunOptions::default()).await.unwrap();
    assert_eq!(report.executed(), vec![Phase::Run, Phase::Extract]);
    assert_eq!(h.calls(), (1, 2, 2));

    // `threads` is excluded from every fingerprint.
    let reordered = h.job(json!({"threads": 2, "load": 1500, "case": "cantilever"}));
    let report = h.run(&reordered, RunOptions::default()).await.unwrap();
    assert_eq!(outcomes(&report), vec![PhaseOutcome::Skipped; 3]);

    // `case` changes Setup and therefore everything downstream.
    let new_case = h.job(json!({"case": "simply-supported", "load": 1500, "threads": 2}));
    let report = h.run(&new_case, RunOptions::default()).await.unwrap();
    assert_eq!(report.executed(), Phase::ALL.to_vec());
    assert_eq!(h.calls(), (2, 3, 3));
}

#[tokio::test]
async fn force_recompute_reruns_every_phase() {
    let h = Harness::new();
    let job = h.job(params());
    h.run(&job, RunOptions::default()).await.unwrap();

    let plan = h
        .orchestrator
        .plan(
            &job,
            RunOptions {
                force_recompute: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(plan.start(), Some(Phase::Setup));

    let report = h
        .run(
            &job,
            RunOptions {
                force_recompute: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.executed(), Phase::ALL.to_vec());
    assert_eq!(h.calls(), (2, 2, 2));
}

#[tokio::test]
async fn plan_has_no_side_effects() {
    let h = Harness::new();
    let job = h.job(params());

    let plan = h.orchestrator.plan(&job, RunOptions::default()).unwrap();
    assert_eq!(plan.start(), Some(Phase::Setup));
    assert!(plan.phases.iter().all(|p| p.execute));
    assert!(!job.job_dir().exists());

    h.run(&job, RunOptions::default()).await.unwrap();
    fs::remove_file(job.deliverables().primary_output()).unwrap();

    let plan = h.orchestrator.plan(&job, RunOptions::default()).unwrap();
    let execute: Vec<bool> = plan.phases.iter().map(|p| p.execute).collect();
    assert_eq!(execute, vec![false, true, true]);
    assert_eq!(plan.phases[0].status, PhaseStatus::Done);
    assert_eq!(h.calls(), (1, 1, 1));
}

// ---------------------------------------------------------------------------
// Failure, cancellation, corruption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_phase_is_not_rerun_without_request() {
    let h = Harness::new();
    let job = h.job(params());
    h.engine.fatal_failures.store(1, Ordering::SeqCst);

    let report = h.run(&job, RunOptions::default()).await.unwrap();
    assert_matches!(
        report.outcome(Phase::Run),
        Some(PhaseOutcome::Failed { message }) if message.contains("solver diverged")
    );
    assert_eq!(report.outcome(Phase::Extract), Some(&PhaseOutcome::NotReached));

    let err = h.run(&job, RunOptions::default()).await.unwrap_err();
    assert_matches!(
        &err,
        PipelineError::PreviouslyFailed { phase: Phase::Run, fingerprint, .. }
            if fingerprint == &job.fingerprints().job
    );
    assert_eq!(h.calls(), (1, 1, 0));

    let report = h
        .run(
            &job,
            RunOptions {
                rerun_failed: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.executed(), vec![Phase::Run, Phase::Extract]);
    let metadata = MetadataStore::load(job.job_dir()).unwrap().unwrap();
    assert!(metadata.last_failure.is_none());
}

#[tokio::test]
async fn transient_run_errors_are_retried_and_counted() {
    let h = Harness::new();
    let job = h.job(params());
    h.engine.transient_failures.store(2, Ordering::SeqCst);

    let report = h.run(&job, RunOptions::default()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.retry_count, 2);
    assert_eq!(h.engine.runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancellation_during_setup_writes_no_metadata() {
    let h = Harness::new();
    let job = h.job(params());
    h.setup.block.store(true, Ordering::SeqCst);

    let cancel = cancel_after(Duration::from_millis(50));
    let report = h
        .orchestrator
        .run(&job, RunOptions::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(
        outcomes(&report),
        vec![PhaseOutcome::Cancelled, PhaseOutcome::NotReached, PhaseOutcome::NotReached]
    );
    assert!(!MetadataStore::path(job.job_dir()).exists());
    assert!(!job.deliverables().for_phase(Phase::Setup)[0].path.exists());
    assert_matches!(report.into_result(), Err(PipelineError::Cancelled { phase: Phase::Setup, .. }));
}

#[tokio::test]
async fn cancellation_during_run_keeps_setup_and_discards_partial_run() {
    let h = Harness::new();
    let job = h.job(params());
    h.engine.hang.store(true, Ordering::SeqCst);
    fs::create_dir_all(job.job_dir()).unwrap();
    fs::write(job.deliverables().primary_output(), b"partial").unwrap();

    let cancel = cancel_after(Duration::from_millis(50));
    let report = h
        .orchestrator
        .run(&job, RunOptions::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome(Phase::Run), Some(&PhaseOutcome::Cancelled));
    assert!(!job.deliverables().primary_output().exists());
    let metadata = MetadataStore::load(job.job_dir()).unwrap().unwrap();
    assert!(metadata.setup_done);
    assert!(!metadata.run_done);
    assert!(metadata.last_failure.is_none());

    // Resume picks up at Run.
    h.engine.hang.store(false, Ordering::SeqCst);
    let report = h.run(&job, RunOptions::default()).await.unwrap();
    assert_eq!(report.executed(), vec![Phase::Run, Phase::Extract]);
}

#[tokio::test]
async fn corrupt_metadata_is_quarantined_and_job_recomputed() {
    let h = Harness::new();
    let job = h.job(params());
    h.run(&job, RunOptions::default()).await.unwrap();

    fs::write(MetadataStore::path(job.job_dir()), b"{not json").unwrap();
    let plan = h.orchestrator.plan(&job, RunOptions::default()).unwrap();
    assert!(plan.metadata_corrupt);

    let report = h.run(&job, RunOptions::default()).await.unwrap();
    assert_eq!(report.executed(), Phase::ALL.to_vec());

    let quarantined = fs::read_dir(job.job_dir().join(METADATA_DIR))
        .unwrap()
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"));
    assert!(quarantined);
    assert!(MetadataStore::load(job.job_dir()).unwrap().unwrap().extract_done);
}

#[tokio::test]
async fn invalid_deliverable_triggers_full_recompute() {
    let h = Harness::new();
    let job = h.job(params());
    h.run(&job, RunOptions::default()).await.unwrap();

    let summary = &job.deliverables().for_phase(Phase::Extract)[0].path;
    fs::write(summary, b"not json").unwrap();

    let report = h.run(&job, RunOptions::default()).await.unwrap();
    assert_eq!(report.executed(), Phase::ALL.to_vec());
    assert_eq!(h.calls(), (2, 2, 2));
    let contents = fs::read_to_string(summary).unwrap();
    assert!(contents.contains("max_stress"));
}

#[tokio::test]
async fn unverifiable_output_fails_the_phase() {
    let h = Harness::new();
    let job = h.job(params());
    // Extract "succeeds" but writes invalid JSON.
    let bad_extract = Arc::new(WriteDeliverables::new("plain text"));
    let h = Harness {
        orchestrator: h.orchestrator.with_handlers(h.setup.clone(), bad_extract),
        ..h
    };

    let report = h.run(&job, RunOptions::default()).await.unwrap();
    assert_matches!(
        report.outcome(Phase::Extract),
        Some(PhaseOutcome::Failed { message }) if message.contains("deliverables not produced")
    );
    let metadata = MetadataStore::load(job.job_dir()).unwrap().unwrap();
    assert!(metadata.run_done);
    assert!(!metadata.extract_done);
    assert_eq!(metadata.last_failure.unwrap().phase, Phase::Extract);
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_never_regresses_and_ends_at_100() {
    let mut h = Harness::new();
    let job = h.job(params());
    h.run(&job, RunOptions::default()).await.unwrap();

    let percents: Vec<f64> = h
        .events
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            JobEvent::Progress { percent, .. } => Some(percent),
            JobEvent::Log { .. } => None,
        })
        .collect();
    assert!(percents.len() >= 3);
    assert!(percents.windows(2).all(|w| w[1] >= w[0]), "{percents:?}");
    assert_eq!(percents.last().copied(), Some(100.0));
}

#[tokio::test]
async fn unsafe_fast_path_adopts_existing_outputs() {
    let h = Harness::with_config(OrchestratorConfig {
        unsafe_fast_path: true,
        progress_interval: Duration::from_millis(10),
    });
    let job = h.job(params());
    for phase in Phase::ALL {
        for deliverable in job.deliverables().for_phase(phase) {
            fs::create_dir_all(deliverable.path.parent().unwrap()).unwrap();
            fs::write(&deliverable.path, r#"{"ok": true}"#).unwrap();
        }
    }

    let report = h.run(&job, RunOptions::default()).await.unwrap();
    assert_eq!(outcomes(&report), vec![PhaseOutcome::Skipped; 3]);
    assert_eq!(h.calls(), (0, 0, 0));
    let metadata = MetadataStore::load(job.job_dir()).unwrap().unwrap();
    assert!(metadata.setup_done && metadata.run_done && metadata.extract_done);
}
