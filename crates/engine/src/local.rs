//! Run phase as a local child process.
//!
//! The engine command receives the job descriptor as JSON on stdin and the
//! job's locations in `STAGEHAND_*` environment variables. Its output is
//! scanned line by line for progress markers:
//!
//! ```text
//! progress: 42%
//! [subtask] begin meshing
//! [subtask] end meshing
//! ```
//!
//! Every other line is forwarded to the event channel as a log message.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use stagehand_core::profiler::SubtaskScope;
use stagehand_events::LogLevel;

use crate::error::EngineError;
use crate::process::{run_process, ProcessError, ProcessOutput, ProcessSpec, Stream};
use crate::strategy::{ExecutionContext, ExecutionResult, PreparedJob};

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bprogress:\s*(\d{1,3}(?:\.\d+)?)\s*%").expect("valid regex")
});
static SUBTASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[subtask\]\s+(begin|end)\s+(\S.*?)\s*$").expect("valid regex")
});

/// A progress marker recognised in engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    /// In-phase completion, `0.0..=1.0`.
    Progress(f64),
    SubtaskBegin(String),
    SubtaskEnd(String),
}

/// Recognise a progress marker in one line of output.
pub fn parse_marker(line: &str) -> Option<Marker> {
    if let Some(caps) = SUBTASK_RE.captures(line) {
        let name = caps[2].to_string();
        return Some(match &caps[1] {
            "begin" => Marker::SubtaskBegin(name),
            _ => Marker::SubtaskEnd(name),
        });
    }
    let caps = PROGRESS_RE.captures(line)?;
    let percent: f64 = caps[1].parse().ok()?;
    Some(Marker::Progress((percent / 100.0).clamp(0.0, 1.0)))
}

#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Runs the engine as a child process of this worker.
pub struct LocalProcessStrategy {
    config: LocalConfig,
}

impl LocalProcessStrategy {
    pub fn new(config: LocalConfig) -> Result<Self, EngineError> {
        if config.program.trim().is_empty() {
            return Err(EngineError::Config(
                "local strategy requires an engine command".to_string(),
            ));
        }
        Ok(Self { config })
    }

    fn spec(&self, job: &PreparedJob<'_>) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.config.program)
            .timeout(self.config.timeout)
            .working_dir(
                self.config
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| job.job_dir.to_path_buf()),
            )
            .env("STAGEHAND_JOB_NAME", job.name)
            .env("STAGEHAND_JOB_DIR", job.job_dir.display().to_string())
            .env("STAGEHAND_OUTPUT", job.output.display().to_string())
            .env("STAGEHAND_FINGERPRINT", job.fingerprint.as_str())
            .stdin(job.descriptor.to_value().to_string().into_bytes());
        spec.args = self.config.args.clone();
        spec.env
            .extend(self.config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        spec
    }

    pub async fn execute(&self, job: &PreparedJob<'_>, ctx: &ExecutionContext) -> ExecutionResult {
        let outcome = run_reporting(&self.spec(job), ctx, job.name).await;

        match outcome {
            Ok(output) if output.success() => ExecutionResult::success(0),
            Ok(output) => {
                tracing::warn!(
                    job = job.name,
                    exit_code = output.exit_code,
                    "Engine process failed",
                );
                ExecutionResult::failed(
                    format!(
                        "engine exited with code {}:\n{}",
                        output.exit_code,
                        output.tail_text()
                    ),
                    0,
                )
            }
            Err(ProcessError::Cancelled) => ExecutionResult::cancelled(0),
            Err(ProcessError::Timeout { elapsed_ms, tail }) => ExecutionResult::failed(
                format!("engine timed out after {elapsed_ms}ms:\n{}", tail.join("\n")),
                0,
            ),
            Err(e) => ExecutionResult::failed(e.to_string(), 0),
        }
    }
}

/// Run a process, turning its progress markers into profiler updates and
/// progress messages and its remaining output into log messages.
///
/// Subtasks still open when the process ends are recorded as incomplete.
pub async fn run_reporting(
    spec: &ProcessSpec,
    ctx: &ExecutionContext,
    job: &str,
) -> Result<ProcessOutput, ProcessError> {
    let mut open_subtasks: HashMap<String, SubtaskScope> = HashMap::new();

    let on_line = |stream: Stream, line: &str| match parse_marker(line) {
        Some(Marker::Progress(fraction)) => {
            ctx.profiler.report_fraction(fraction);
            ctx.report_progress();
        }
        Some(Marker::SubtaskBegin(name)) => {
            if let Some(scope) = ctx.profiler.subtask(&name) {
                open_subtasks.insert(name, scope);
            }
        }
        Some(Marker::SubtaskEnd(name)) => match open_subtasks.remove(&name) {
            Some(scope) => {
                scope.complete();
                ctx.report_progress();
            }
            None => {
                tracing::debug!(job, subtask = %name, "End marker without begin");
            }
        },
        None => {
            let level = match stream {
                Stream::Stdout => LogLevel::Info,
                Stream::Stderr => LogLevel::Warn,
            };
            ctx.events.log(level, line);
        }
    };

    let outcome = ctx
        .with_progress(run_process(spec, &ctx.cancel, on_line))
        .await;
    drop(open_subtasks);
    outcome
}
