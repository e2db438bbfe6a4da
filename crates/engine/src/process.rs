//! Child process execution with streamed output.
//!
//! [`run_process`] spawns a command, optionally pipes a payload to stdin,
//! and hands every stdout/stderr line to a callback as it arrives, so a
//! caller can turn output into progress while the child is still running.
//! The wait is raced against an optional timeout and a
//! [`CancellationToken`]; either one kills the child and, on Unix, every
//! process in its group.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lines of combined output kept for failure diagnostics.
pub const TAIL_LINES: usize = 20;

/// Longest line kept verbatim; longer lines are truncated.
const MAX_LINE_CHARS: usize = 4096;

/// How long output may stay open after the child exits.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Bytes written to stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.into()],
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A process that ran to exit (successfully or not).
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub duration: Duration,
    /// Last [`TAIL_LINES`] lines of combined output.
    pub tail: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error waiting for process: {0}")]
    Io(#[from] std::io::Error),

    #[error("process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64, tail: Vec<String> },

    #[error("process cancelled")]
    Cancelled,
}

/// Run a process to completion, streaming its output lines to `on_line`.
pub async fn run_process<F>(
    spec: &ProcessSpec,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<ProcessOutput, ProcessError>
where
    F: FnMut(Stream, &str),
{
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so cancellation also reaches grandchildren.
    #[cfg(unix)]
    cmd.process_group(0);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();
    tracing::debug!(program = %spec.program, pid, "Process spawned");

    if let (Some(mut stdin), Some(bytes)) = (child.stdin.take(), spec.stdin.clone()) {
        // Written from a task so a child that never reads stdin cannot stall us.
        tokio::spawn(async move {
            // Best-effort: the child may close stdin early.
            let _ = stdin.write_all(&bytes).await;
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    let deadline = async {
        match spec.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut tail = Tail::default();
    let mut output_open = true;

    // Drain output while waiting for the child itself to exit.
    let status = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child, pid).await;
                return Err(ProcessError::Cancelled);
            }
            _ = &mut deadline => {
                terminate(&mut child, pid).await;
                return Err(ProcessError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    tail: tail.into_lines(),
                });
            }
            line = rx.recv(), if output_open => match line {
                Some((stream, line)) => {
                    on_line(stream, &line);
                    tail.push(line);
                }
                None => output_open = false,
            },
            status = child.wait() => break status?,
        }
    };

    // Pick up what is still buffered. Pipes held open past the grace period
    // belong to background processes the child left behind.
    if output_open {
        let grace = tokio::time::sleep(OUTPUT_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some((stream, line)) => {
                        on_line(stream, &line);
                        tail.push(line);
                    }
                    None => break,
                },
                _ = &mut grace => {
                    tracing::warn!(
                        program = %spec.program,
                        "Output still open after exit, killing leftover background processes",
                    );
                    kill_group(pid);
                    break;
                }
            }
        }
    }

    let output = ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        duration: start.elapsed(),
        tail: tail.into_lines(),
    };
    tracing::debug!(
        program = %spec.program,
        exit_code = output.exit_code,
        duration_ms = output.duration.as_millis() as u64,
        "Process exited",
    );
    Ok(output)
}

/// Last [`TAIL_LINES`] lines of combined output.
#[derive(Default)]
struct Tail(VecDeque<String>);

impl Tail {
    fn push(&mut self, line: String) {
        if self.0.len() == TAIL_LINES {
            self.0.pop_front();
        }
        self.0.push_back(line);
    }

    fn into_lines(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill child process");
    }
}

/// SIGKILL the process group the child leads.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal. The group was created for this
    // child by `process_group(0)`, so its id equals the child's pid.
    let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if ret != 0 {
        // ESRCH: every member has already exited.
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send((stream, decode_line(&buf))).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(?stream, error = %e, "Stopped reading process output");
                break;
            }
        }
    }
}

/// Strip the line ending, replace invalid UTF-8, and cap the length.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let mut line = String::from_utf8_lossy(raw).into_owned();
    if line.len() > MAX_LINE_CHARS {
        let cut = (0..=MAX_LINE_CHARS)
            .rev()
            .find(|&i| line.is_char_boundary(i))
            .unwrap_or(0);
        line.truncate(cut);
    }
    line
}
