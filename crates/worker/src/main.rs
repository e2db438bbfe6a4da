//! `stagehand-worker` -- runs one job through Setup, Run, and Extract.
//!
//! ```text
//! stagehand-worker <job.json> [--force] [--rerun-failed] [--plan]
//! ```
//!
//! Progress and log messages are written to stdout as JSON lines; the
//! worker's own diagnostics go to stderr through `tracing`. `--plan` prints
//! the per-phase plan as JSON and exits without running anything.
//!
//! SIGINT/SIGTERM cancel the job cooperatively: the running phase is
//! stopped, its partial output discarded, and no metadata is written for it.
//!
//! # Environment variables
//!
//! See [`WorkerConfig::from_env`] for the full table. The most common:
//!
//! | Variable                     | Required     | Default | Description                    |
//! |------------------------------|--------------|---------|--------------------------------|
//! | `STAGEHAND_STRATEGY`         | no           | `local` | `local`, `remote`, or `batch`  |
//! | `STAGEHAND_ENGINE_COMMAND`   | for `local`  | --      | Engine executable              |
//! | `STAGEHAND_REMOTE_URL`       | for `remote` | --      | Remote engine service base URL |
//! | `STAGEHAND_BATCH_URL`        | for `batch`  | --      | Batch service base URL         |
//! | `STAGEHAND_UNSAFE_FAST_PATH` | no           | `false` | Trust deliverables without metadata |
//! | `RUST_LOG`                   | no           | `stagehand_worker=info,...` | Log filter |
//!
//! # Exit codes
//!
//! `0` success, `1` phase failure, `2` invalid invocation or
//! configuration, `130` cancelled.

use std::process::ExitCode;

use anyhow::Context;
use stagehand_core::config::ProcessEnv;
use stagehand_core::profiler::Profiler;
use stagehand_engine::Strategy;
use stagehand_events::{channel, JsonLinesSink};
use stagehand_pipeline::{JobFile, JobReport, Orchestrator, PipelineError};
use stagehand_worker::cli::{Args, USAGE};
use stagehand_worker::config::WorkerConfig;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "stagehand_worker=info,stagehand_pipeline=info,stagehand_engine=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Worker failed");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = WorkerConfig::from_env(&ProcessEnv).context("Invalid worker configuration")?;
    let file = JobFile::load(&args.job_file)
        .with_context(|| format!("Failed to load job file {}", args.job_file.display()))?;
    let job = file.job()?;

    let profiler = match &config.timings_path {
        Some(path) => Profiler::with_store(path.clone(), config.weights)?,
        None => Profiler::new(config.weights),
    };
    let strategy = Strategy::from_config(config.strategy.clone())?;
    tracing::info!(
        job = job.name(),
        strategy = %strategy.kind(),
        fingerprint = job.fingerprints().job.short(),
        "Worker starting",
    );

    let (events, receiver) = channel(config.channel_capacity);
    let orchestrator = Orchestrator::new(strategy, profiler, events)
        .with_handlers(file.setup_handler(), file.extract_handler())
        .with_config(config.orchestrator());

    if args.plan {
        let plan = orchestrator.plan(&job, args.options)?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(ExitCode::SUCCESS);
    }

    let sink = tokio::spawn(JsonLinesSink::run(receiver, tokio::io::stdout()));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::warn!("Shutdown signal received, cancelling job");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run(&job, args.options, &cancel).await;

    // Dropping the last sender lets the sink drain and exit.
    drop(orchestrator);
    let forwarded = sink.await.context("Event sink panicked")?;
    tracing::debug!(forwarded, "Events forwarded");

    Ok(exit_code(outcome.and_then(JobReport::into_result)))
}

fn exit_code(outcome: Result<JobReport, PipelineError>) -> ExitCode {
    match outcome {
        Ok(report) => {
            tracing::info!(
                job = %report.name,
                executed = ?report.executed(),
                retry_count = report.retry_count,
                "Job complete",
            );
            ExitCode::SUCCESS
        }
        Err(e @ PipelineError::Cancelled { .. }) => {
            tracing::warn!(error = %e, "Job cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e @ (PipelineError::Validation(_) | PipelineError::Core(_))) => {
            tracing::error!(error = %e, "Job could not run");
            ExitCode::from(EXIT_USAGE)
        }
        Err(e) => {
            tracing::error!(phase = ?e.phase(), error = %e, "Job failed");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
