use std::path::PathBuf;
use std::time::Duration;

use stagehand_core::config::{
    env_bool, env_list, env_millis, env_opt, env_or, env_required, ConfigError, EnvSource,
};
use stagehand_core::estimation::PhaseWeights;
use stagehand_engine::{
    Backoff, BatchConfig, LocalConfig, PollingLoop, RemoteConfig, RetryPolicy, StrategyConfig,
    StrategyKind,
};
use stagehand_events::DEFAULT_CAPACITY;
use stagehand_pipeline::OrchestratorConfig;
use validator::Validate;

/// Default timeout for one HTTP request to a remote backend.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker configuration, resolved once at startup.
#[derive(Debug, Clone, Validate)]
pub struct WorkerConfig {
    /// Run-phase backend and its settings.
    pub strategy: StrategyConfig,
    #[validate(range(min = 1, max = 1_000_000))]
    pub channel_capacity: usize,
    #[validate(range(min = 1, max = 3_600_000))]
    pub progress_interval_ms: u64,
    #[validate(range(max = 100))]
    pub max_retries: u32,
    pub unsafe_fast_path: bool,
    /// Timing history file; in-memory only when absent.
    pub timings_path: Option<PathBuf>,
    #[validate(nested)]
    pub weights: PhaseWeights,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `STAGEHAND_STRATEGY`             | `local`                 |
    /// | `STAGEHAND_ENGINE_COMMAND`       | required for `local`    |
    /// | `STAGEHAND_ENGINE_ARGS`          | none (comma-separated)  |
    /// | `STAGEHAND_ENGINE_TIMEOUT_MS`    | no timeout              |
    /// | `STAGEHAND_REMOTE_URL`           | required for `remote`   |
    /// | `STAGEHAND_REMOTE_TARGET`        | first remote target     |
    /// | `STAGEHAND_EXPECT_FULL_TARGETS`  | `true`                  |
    /// | `STAGEHAND_BATCH_URL`            | required for `batch`    |
    /// | `STAGEHAND_API_TOKEN`            | none                    |
    /// | `STAGEHAND_REQUEST_TIMEOUT_MS`   | `30000`                 |
    /// | `STAGEHAND_MAX_RETRIES`          | `3`                     |
    /// | `STAGEHAND_RETRY_INITIAL_MS`     | `1000`                  |
    /// | `STAGEHAND_RETRY_MAX_MS`         | `30000`                 |
    /// | `STAGEHAND_POLL_INTERVAL_MS`     | `10000`                 |
    /// | `STAGEHAND_MAX_POLLS`            | `360`                   |
    /// | `STAGEHAND_MAX_ELAPSED_MS`       | `3600000`               |
    /// | `STAGEHAND_CHANNEL_CAPACITY`     | `256`                   |
    /// | `STAGEHAND_PROGRESS_INTERVAL_MS` | `1000`                  |
    /// | `STAGEHAND_UNSAFE_FAST_PATH`     | `false`                 |
    /// | `STAGEHAND_TIMINGS_PATH`         | none                    |
    /// | `STAGEHAND_PHASE_WEIGHTS`        | `0.1,0.8,0.1`           |
    pub fn from_env(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let kind: StrategyKind = env_or(env, "STAGEHAND_STRATEGY", StrategyKind::Local)?;
        let max_retries: u32 = env_or(env, "STAGEHAND_MAX_RETRIES", 3)?;

        let strategy = match kind {
            StrategyKind::Local => StrategyConfig::Local(LocalConfig {
                program: env_required(env, "STAGEHAND_ENGINE_COMMAND")?,
                args: env_list(env, "STAGEHAND_ENGINE_ARGS").unwrap_or_default(),
                timeout: env_millis(env, "STAGEHAND_ENGINE_TIMEOUT_MS")?,
                ..Default::default()
            }),
            StrategyKind::Remote => StrategyConfig::Remote(RemoteConfig {
                base_url: env_required(env, "STAGEHAND_REMOTE_URL")?,
                api_token: env_opt(env, "STAGEHAND_API_TOKEN")?,
                preferred_target: env_opt(env, "STAGEHAND_REMOTE_TARGET")?,
                expect_full_targets: env_bool(env, "STAGEHAND_EXPECT_FULL_TARGETS")?.unwrap_or(true),
                request_timeout: Some(request_timeout(env)?),
                retry: retry_policy(env, max_retries)?,
            }),
            StrategyKind::Batch => StrategyConfig::Batch(BatchConfig {
                base_url: env_required(env, "STAGEHAND_BATCH_URL")?,
                api_token: env_opt(env, "STAGEHAND_API_TOKEN")?,
                request_timeout: Some(request_timeout(env)?),
                retry: retry_policy(env, max_retries)?,
                polling: polling(env)?,
            }),
        };

        let config = Self {
            strategy,
            channel_capacity: env_or(env, "STAGEHAND_CHANNEL_CAPACITY", DEFAULT_CAPACITY)?,
            progress_interval_ms: env_or(env, "STAGEHAND_PROGRESS_INTERVAL_MS", 1000)?,
            max_retries,
            unsafe_fast_path: env_bool(env, "STAGEHAND_UNSAFE_FAST_PATH")?.unwrap_or(false),
            timings_path: env_opt(env, "STAGEHAND_TIMINGS_PATH")?,
            weights: weights(env)?,
        };
        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(config)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            unsafe_fast_path: self.unsafe_fast_path,
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }
}

fn request_timeout(env: &dyn EnvSource) -> Result<Duration, ConfigError> {
    Ok(env_millis(env, "STAGEHAND_REQUEST_TIMEOUT_MS")?.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
}

fn retry_policy(env: &dyn EnvSource, max_retries: u32) -> Result<RetryPolicy, ConfigError> {
    let backoff = match Backoff::default() {
        Backoff::Exponential {
            initial,
            max,
            multiplier,
        } => Backoff::Exponential {
            initial: env_millis(env, "STAGEHAND_RETRY_INITIAL_MS")?.unwrap_or(initial),
            max: env_millis(env, "STAGEHAND_RETRY_MAX_MS")?.unwrap_or(max),
            multiplier,
        },
        fixed => fixed,
    };
    Ok(RetryPolicy {
        max_retries,
        backoff,
    })
}

fn polling(env: &dyn EnvSource) -> Result<PollingLoop, ConfigError> {
    let defaults = PollingLoop::default();
    Ok(PollingLoop {
        interval: env_millis(env, "STAGEHAND_POLL_INTERVAL_MS")?.unwrap_or(defaults.interval),
        max_polls: env_or(env, "STAGEHAND_MAX_POLLS", defaults.max_polls)?,
        max_elapsed: env_millis(env, "STAGEHAND_MAX_ELAPSED_MS")?.unwrap_or(defaults.max_elapsed),
    })
}

/// `setup,run,extract` as three non-negative numbers.
fn weights(env: &dyn EnvSource) -> Result<PhaseWeights, ConfigError> {
    const KEY: &str = "STAGEHAND_PHASE_WEIGHTS";
    let Some(parts) = env_list(env, KEY) else {
        return Ok(PhaseWeights::default());
    };
    let invalid = |reason: String| ConfigError::Invalid {
        key: KEY.to_string(),
        value: parts.join(","),
        reason,
    };
    let values = parts
        .iter()
        .map(|p| p.parse::<f64>().map_err(|e| invalid(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    match values[..] {
        [setup, run, extract] => Ok(PhaseWeights { setup, run, extract }),
        _ => Err(invalid(format!("expected 3 weights, got {}", values.len()))),
    }
}
