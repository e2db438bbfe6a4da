//! End-to-end behaviour of the three Run-phase strategies against
//! in-memory backends and real child processes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::json;
use stagehand_core::descriptor::JobDescriptor;
use stagehand_core::estimation::PhaseWeights;
use stagehand_core::fingerprint::Fingerprint;
use stagehand_core::profiler::Profiler;
use stagehand_core::types::Phase;
use stagehand_engine::{
    Backoff, BatchBackend, BatchRequest, BatchState, BatchStrategy, ExecutionContext,
    ExecutionError, ExecutionStatus, LocalConfig, LocalProcessStrategy, PollingLoop, PreparedJob,
    RemoteConfig, RemoteEngine, RemoteSyncStrategy, RemoteTarget, RetryPolicy,
};
use stagehand_events::{channel, EventReceiver, JobEvent, LogLevel};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Job {
    dir: tempfile::TempDir,
    descriptor: JobDescriptor,
    fingerprint: Fingerprint,
    output: PathBuf,
}

impl Job {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("result.bin");
        Self {
            descriptor: JobDescriptor::from_value(json!({"case": "beam", "steps": 4})).unwrap(),
            fingerprint: Fingerprint::from_hex("ab".repeat(32)),
            output,
            dir,
        }
    }

    fn prepared(&self) -> PreparedJob<'_> {
        PreparedJob {
            name: "beam",
            job_dir: self.dir.path(),
            descriptor: &self.descriptor,
            fingerprint: &self.fingerprint,
            output: &self.output,
        }
    }
}

fn context() -> (ExecutionContext, EventReceiver) {
    let (tx, rx) = channel(64);
    let mut ctx = ExecutionContext::new(
        Profiler::new(PhaseWeights::default()),
        tx,
        CancellationToken::new(),
    );
    ctx.progress_interval = Duration::from_millis(20);
    (ctx, rx)
}

fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff: Backoff::Fixed(Duration::from_millis(1)),
    }
}

fn quick_polling() -> PollingLoop {
    PollingLoop {
        interval: Duration::from_millis(1),
        max_polls: 20,
        max_elapsed: Duration::from_secs(10),
    }
}

fn warnings(rx: &mut EventReceiver) -> Vec<String> {
    rx.drain()
        .into_iter()
        .filter_map(|e| match e {
            JobEvent::Log {
                level: LogLevel::Warn,
                text,
                ..
            } => Some(text),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockBatch {
    submit_failures: u32,
    always_fail_submit: bool,
    states: Mutex<Vec<BatchState>>,
    submits: AtomicU32,
    aborts: AtomicU32,
    tokens: Mutex<Vec<uuid::Uuid>>,
}

#[async_trait]
impl BatchBackend for MockBatch {
    async fn submit(&self, request: &BatchRequest) -> Result<String, ExecutionError> {
        self.tokens.lock().unwrap().push(request.client_token);
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        if self.always_fail_submit || n <= self.submit_failures {
            return Err(ExecutionError::transient("queue congested"));
        }
        Ok("job-17".to_string())
    }

    async fn status(&self, _job_id: &str) -> Result<BatchState, ExecutionError> {
        let mut states = self.states.lock().unwrap();
        Ok(if states.len() > 1 {
            states.remove(0)
        } else {
            states.first().copied().unwrap_or(BatchState::Running)
        })
    }

    async fn fetch_result(&self, _job_id: &str) -> Result<Vec<u8>, ExecutionError> {
        Ok(b"solution".to_vec())
    }

    async fn abort(&self, _job_id: &str) -> Result<(), ExecutionError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn batch_submit_retry_bound() {
    let backend = Arc::new(MockBatch {
        always_fail_submit: true,
        ..Default::default()
    });
    let strategy = BatchStrategy::new(backend.clone(), quick_retry(3), quick_polling());
    let job = Job::new();
    let (ctx, _rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;

    assert_eq!(backend.submits.load(Ordering::SeqCst), 4);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.retry_count, 3);
    assert!(!job.output.exists());
}

#[tokio::test]
async fn batch_transient_twice_then_success() {
    let backend = Arc::new(MockBatch {
        submit_failures: 2,
        states: Mutex::new(vec![
            BatchState::Pending,
            BatchState::Running,
            BatchState::Success,
        ]),
        ..Default::default()
    });
    let strategy = BatchStrategy::new(backend.clone(), quick_retry(3), quick_polling());
    let job = Job::new();
    let (ctx, _rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.retry_count, 2);
    assert_eq!(std::fs::read(&job.output).unwrap(), b"solution");

    // Every attempt of one submission carries the same client token.
    let tokens = backend.tokens.lock().unwrap();
    assert_eq!(tokens.len(), 3);
    assert!(tokens.iter().all(|t| *t == tokens[0]));
}

#[tokio::test]
async fn batch_remote_failure_is_failed_result() {
    let backend = Arc::new(MockBatch {
        states: Mutex::new(vec![BatchState::Running, BatchState::Aborted]),
        ..Default::default()
    });
    let strategy = BatchStrategy::new(backend, quick_retry(3), quick_polling());
    let job = Job::new();
    let (ctx, _rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.unwrap().contains("Aborted"));
}

#[tokio::test]
async fn batch_poll_exhaustion_aborts_remote_job() {
    let backend = Arc::new(MockBatch::default());
    let polling = PollingLoop {
        max_polls: 3,
        ..quick_polling()
    };
    let strategy = BatchStrategy::new(backend.clone(), quick_retry(0), polling);
    let job = Job::new();
    let (ctx, _rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_cancellation_aborts_remote_job() {
    let backend = Arc::new(MockBatch::default());
    let polling = PollingLoop {
        interval: Duration::from_millis(10),
        max_polls: 10_000,
        max_elapsed: Duration::from_secs(60),
    };
    let strategy = BatchStrategy::new(backend.clone(), quick_retry(0), polling);
    let job = Job::new();
    let (ctx, _rx) = context();

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let result = strategy.execute(&job.prepared(), &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
    assert!(!job.output.exists());
}

// ---------------------------------------------------------------------------
// Remote synchronous
// ---------------------------------------------------------------------------

struct MockRemote {
    targets: Vec<RemoteTarget>,
    run_failures: u32,
    runs: AtomicU32,
    last_target: Mutex<Option<String>>,
}

impl MockRemote {
    fn new(targets: Vec<RemoteTarget>, run_failures: u32) -> Self {
        Self {
            targets,
            run_failures,
            runs: AtomicU32::new(0),
            last_target: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RemoteEngine for MockRemote {
    async fn list_targets(&self) -> Result<Vec<RemoteTarget>, ExecutionError> {
        Ok(self.targets.clone())
    }

    async fn run(
        &self,
        request: &stagehand_engine::remote::RemoteRunRequest,
    ) -> Result<Vec<u8>, ExecutionError> {
        *self.last_target.lock().unwrap() = Some(request.target.clone());
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.run_failures {
            return Err(ExecutionError::transient("502 bad gateway"));
        }
        Ok(format!("ran {}", request.job).into_bytes())
    }
}

fn remote_config() -> RemoteConfig {
    RemoteConfig {
        base_url: "http://engine.invalid".to_string(),
        retry: quick_retry(3),
        ..Default::default()
    }
}

#[tokio::test]
async fn remote_run_writes_primary_output() {
    let engine = Arc::new(MockRemote::new(
        vec![
            RemoteTarget::new("localhost", true),
            RemoteTarget::new("cluster-a", false),
        ],
        1,
    ));
    let strategy = RemoteSyncStrategy::new(engine.clone(), remote_config());
    let job = Job::new();
    let (ctx, mut rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.retry_count, 1);
    assert_eq!(std::fs::read_to_string(&job.output).unwrap(), "ran beam");
    assert_eq!(engine.last_target.lock().unwrap().as_deref(), Some("cluster-a"));
    assert!(warnings(&mut rx).is_empty());
}

#[tokio::test]
async fn remote_degraded_targets_raise_warning_but_proceed() {
    let engine = Arc::new(MockRemote::new(vec![RemoteTarget::new("localhost", true)], 0));
    let strategy = RemoteSyncStrategy::new(engine, remote_config());
    let job = Job::new();
    let (ctx, mut rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    let warnings = warnings(&mut rx);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Re-authenticate with the remote service"));
}

#[tokio::test]
async fn remote_without_targets_fails() {
    let engine = Arc::new(MockRemote::new(vec![], 0));
    let strategy = RemoteSyncStrategy::new(engine, remote_config());
    let job = Job::new();
    let (ctx, _rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
}

// ---------------------------------------------------------------------------
// Local process
// ---------------------------------------------------------------------------

fn shell_strategy(script: &str, timeout: Option<Duration>) -> LocalProcessStrategy {
    LocalProcessStrategy::new(LocalConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        timeout,
        ..Default::default()
    })
    .unwrap()
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn local_process_reports_progress_and_subtasks() {
    let script = r#"
        cat > "$STAGEHAND_JOB_DIR/descriptor.json"
        echo "[subtask] begin mesh"
        echo "progress: 25%"
        echo "[subtask] end mesh"
        echo "solver converged"
        echo "progress: 100%"
        printf 'done' > "$STAGEHAND_OUTPUT"
    "#;
    let strategy = shell_strategy(script, None);
    let job = Job::new();
    let (ctx, mut rx) = context();

    let phase = ctx.profiler.phase(Phase::Run);
    let result = strategy.execute(&job.prepared(), &ctx).await;
    phase.complete();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(read(&job.output), "done");
    let descriptor: serde_json::Value =
        serde_json::from_str(&read(&job.dir.path().join("descriptor.json"))).unwrap();
    assert_eq!(descriptor["case"], "beam");

    assert_eq!(ctx.profiler.history().samples("run/mesh"), 1);

    let events = rx.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::Log { level: LogLevel::Info, text, .. } if text == "solver converged"
    )));
    let percents: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(!percents.is_empty());
    assert!(percents.windows(2).all(|w| w[1] >= w[0]));
}

#[tokio::test]
async fn local_process_failure_carries_output_tail() {
    let strategy = shell_strategy("echo 'reading mesh'; echo 'singular matrix' >&2; exit 2", None);
    let job = Job::new();
    let (ctx, _rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert!(error.contains("code 2"));
    assert!(error.contains("singular matrix"));
}

#[tokio::test]
async fn local_process_timeout_is_failure() {
    let strategy = shell_strategy("exec sleep 30", Some(Duration::from_millis(100)));
    let job = Job::new();
    let (ctx, _rx) = context();

    let result = strategy.execute(&job.prepared(), &ctx).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_matches!(result.error.as_deref(), Some(e) if e.contains("timed out"));
}

#[tokio::test]
async fn local_process_cancellation_kills_child() {
    let strategy = shell_strategy("echo '[subtask] begin long'; exec sleep 30", None);
    let job = Job::new();
    let (ctx, _rx) = context();

    let phase = ctx.profiler.phase(Phase::Run);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let result = strategy.execute(&job.prepared(), &ctx).await;
    drop(phase);

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    // The interrupted subtask is recorded but never folded into history.
    let records = ctx.profiler.records();
    assert!(records
        .iter()
        .any(|r| r.subtask.as_deref() == Some("long") && !r.completed));
    assert_eq!(ctx.profiler.history().samples("run/long"), 0);
}
