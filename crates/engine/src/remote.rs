//! Run phase as a blocking call against a remote engine service.
//!
//! The service advertises named execution targets at `GET /targets` and
//! runs a job synchronously at `POST /run`, answering with the result
//! artifact. When the advertised list collapses to a single local-only
//! target while a full set was expected, the run still proceeds but a
//! capability warning is raised on the event channel: that usually means
//! the remote session expired and the service fell back to its minimal
//! offline mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, ExecutionError};
use crate::http::{self, build_client, endpoint};
use crate::retry::RetryPolicy;
use crate::strategy::{write_output, ExecutionContext, ExecutionResult, PreparedJob};

/// A named place the remote service can run a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub name: String,
    /// Minimal target that runs on the service host itself.
    #[serde(default)]
    pub local: bool,
}

impl RemoteTarget {
    pub fn new(name: impl Into<String>, local: bool) -> Self {
        Self {
            name: name.into(),
            local,
        }
    }
}

/// Body of a `POST /run` request.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteRunRequest {
    pub job: String,
    pub target: String,
    pub fingerprint: String,
    pub descriptor: Value,
}

/// A synchronous remote engine.
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<RemoteTarget>, ExecutionError>;

    /// Run a job to completion and return the result artifact.
    async fn run(&self, request: &RemoteRunRequest) -> Result<Vec<u8>, ExecutionError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// [`RemoteEngine`] over the service's REST API.
pub struct HttpRemoteEngine {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpRemoteEngine {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        request_timeout: Option<Duration>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            client: build_client(request_timeout)?,
            base_url: base_url.into(),
            api_token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteEngine for HttpRemoteEngine {
    async fn list_targets(&self) -> Result<Vec<RemoteTarget>, ExecutionError> {
        let response = self
            .authorize(self.client.get(endpoint(&self.base_url, "targets")))
            .send()
            .await
            .map_err(http::HttpError::from)?;
        Ok(http::parse_response(response).await?)
    }

    async fn run(&self, request: &RemoteRunRequest) -> Result<Vec<u8>, ExecutionError> {
        let response = self
            .authorize(self.client.post(endpoint(&self.base_url, "run")))
            .json(request)
            .send()
            .await
            .map_err(http::HttpError::from)?;
        Ok(http::read_body(response).await?)
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    /// Target to use when the service offers it.
    pub preferred_target: Option<String>,
    /// Whether a full (non-local) target set is expected.
    pub expect_full_targets: bool,
    pub request_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: None,
            preferred_target: None,
            expect_full_targets: true,
            request_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Warning text when the service only offers its minimal local target.
pub fn capability_warning(targets: &[RemoteTarget], expect_full: bool) -> Option<String> {
    match targets {
        [only] if expect_full && only.local => Some(format!(
            "remote service offers only the local target '{}'; computation will not run on \
             the full remote target set. Re-authenticate with the remote service to restore it",
            only.name
        )),
        _ => None,
    }
}

/// Choose the preferred target if offered, else the first non-local one.
pub fn select_target<'t>(
    targets: &'t [RemoteTarget],
    preferred: Option<&str>,
) -> Option<&'t RemoteTarget> {
    if let Some(preferred) = preferred {
        if let Some(target) = targets.iter().find(|t| t.name == preferred) {
            return Some(target);
        }
        tracing::warn!(preferred, "Preferred remote target not offered");
    }
    targets
        .iter()
        .find(|t| !t.local)
        .or_else(|| targets.first())
}

pub struct RemoteSyncStrategy {
    engine: Arc<dyn RemoteEngine>,
    config: RemoteConfig,
}

impl RemoteSyncStrategy {
    pub fn new(engine: Arc<dyn RemoteEngine>, config: RemoteConfig) -> Self {
        Self { engine, config }
    }

    pub fn over_http(config: RemoteConfig) -> Result<Self, EngineError> {
        if config.base_url.trim().is_empty() {
            return Err(EngineError::Config(
                "remote strategy requires a service URL".to_string(),
            ));
        }
        let engine = HttpRemoteEngine::new(
            config.base_url.clone(),
            config.api_token.clone(),
            config.request_timeout,
        )?;
        Ok(Self::new(Arc::new(engine), config))
    }

    pub async fn execute(&self, job: &PreparedJob<'_>, ctx: &ExecutionContext) -> ExecutionResult {
        let retry = &self.config.retry;

        let listed = retry
            .run("list_targets", &ctx.cancel, |_| self.engine.list_targets())
            .await;
        let mut retry_count = listed.retry_count;
        let targets = match listed.result {
            Ok(targets) => targets,
            Err(e) => return ExecutionResult::from_error(e, retry_count),
        };

        if let Some(warning) = capability_warning(&targets, self.config.expect_full_targets) {
            tracing::warn!(job = job.name, targets = targets.len(), "{warning}");
            ctx.events.warn(warning);
        }

        let Some(target) = select_target(&targets, self.config.preferred_target.as_deref()) else {
            return ExecutionResult::failed("remote service offers no execution targets", retry_count);
        };
        tracing::info!(job = job.name, target = %target.name, "Running on remote target");

        let request = RemoteRunRequest {
            job: job.name.to_string(),
            target: target.name.clone(),
            fingerprint: job.fingerprint.as_str().to_string(),
            descriptor: job.descriptor.to_value(),
        };
        let ran = ctx
            .with_progress(retry.run("run", &ctx.cancel, |_| self.engine.run(&request)))
            .await;
        retry_count += ran.retry_count;

        match ran.result.and_then(|bytes| write_output(job, &bytes)) {
            Ok(()) => ExecutionResult::success(retry_count),
            Err(e) => ExecutionResult::from_error(e, retry_count),
        }
    }
}
