//! Run phase as an asynchronous cloud batch job.
//!
//! Submission returns an id; the job is then polled at a fixed interval
//! within a poll-count and wall-clock budget. On success the result is
//! downloaded into the Run artifact. Cancellation (and a budget overrun)
//! asks the backend to abort the remote job on a best-effort basis.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, ExecutionError};
use crate::http::{self, build_client, endpoint};
use crate::polling::{BatchState, PollOutcome, PollingLoop};
use crate::retry::RetryPolicy;
use crate::strategy::{write_output, ExecutionContext, ExecutionResult, PreparedJob};

/// Upper bound on the best-effort abort request.
const ABORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    pub job: String,
    pub fingerprint: String,
    pub descriptor: Value,
    /// Stable across retries of one submission so the backend can
    /// deduplicate a request whose response was lost.
    pub client_token: Uuid,
}

/// An asynchronous batch execution service.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Queue a job and return its backend id.
    async fn submit(&self, request: &BatchRequest) -> Result<String, ExecutionError>;

    async fn status(&self, job_id: &str) -> Result<BatchState, ExecutionError>;

    /// Download the result artifact of a succeeded job.
    async fn fetch_result(&self, job_id: &str) -> Result<Vec<u8>, ExecutionError>;

    async fn abort(&self, job_id: &str) -> Result<(), ExecutionError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: BatchState,
}

/// [`BatchBackend`] over a REST API:
///
/// | Call | Endpoint |
/// |---|---|
/// | submit | `POST /jobs` → `{"job_id": ...}` |
/// | status | `GET /jobs/{id}` → `{"state": ...}` |
/// | fetch | `GET /jobs/{id}/result` |
/// | abort | `POST /jobs/{id}/abort` |
pub struct HttpBatchBackend {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBatchBackend {
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

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, endpoint(&self.base_url, path));
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl BatchBackend for HttpBatchBackend {
    async fn submit(&self, request: &BatchRequest) -> Result<String, ExecutionError> {
        let response = self
            .request(reqwest::Method::POST, "jobs")
            .json(request)
            .send()
            .await
            .map_err(http::HttpError::from)?;
        let body: SubmitResponse = http::parse_response(response).await?;
        Ok(body.job_id)
    }

    async fn status(&self, job_id: &str) -> Result<BatchState, ExecutionError> {
        let response = self
            .request(reqwest::Method::GET, &format!("jobs/{job_id}"))
            .send()
            .await
            .map_err(http::HttpError::from)?;
        let body: StatusResponse = http::parse_response(response).await?;
        Ok(body.state)
    }

    async fn fetch_result(&self, job_id: &str) -> Result<Vec<u8>, ExecutionError> {
        let response = self
            .request(reqwest::Method::GET, &format!("jobs/{job_id}/result"))
            .send()
            .await
            .map_err(http::HttpError::from)?;
        Ok(http::read_body(response).await?)
    }

    async fn abort(&self, job_id: &str) -> Result<(), ExecutionError> {
        let response = self
            .request(reqwest::Method::POST, &format!("jobs/{job_id}/abort"))
            .send()
            .await
            .map_err(http::HttpError::from)?;
        http::ensure_success(response).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct BatchConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub polling: PollingLoop,
}

pub struct BatchStrategy {
    backend: Arc<dyn BatchBackend>,
    retry: RetryPolicy,
    polling: PollingLoop,
}

impl BatchStrategy {
    pub fn new(backend: Arc<dyn BatchBackend>, retry: RetryPolicy, polling: PollingLoop) -> Self {
        Self {
            backend,
            retry,
            polling,
        }
    }

    pub fn over_http(config: BatchConfig) -> Result<Self, EngineError> {
        if config.base_url.trim().is_empty() {
            return Err(EngineError::Config(
                "batch strategy requires a service URL".to_string(),
            ));
        }
        if config.polling.max_polls == 0 {
            return Err(EngineError::Config(
                "batch polling needs at least one poll".to_string(),
            ));
        }
        let backend = HttpBatchBackend::new(
            config.base_url.clone(),
            config.api_token.clone(),
            config.request_timeout,
        )?;
        Ok(Self::new(Arc::new(backend), config.retry, config.polling))
    }

    pub async fn execute(&self, job: &PreparedJob<'_>, ctx: &ExecutionContext) -> ExecutionResult {
        let request = BatchRequest {
            job: job.name.to_string(),
            fingerprint: job.fingerprint.as_str().to_string(),
            descriptor: job.descriptor.to_value(),
            client_token: Uuid::new_v4(),
        };

        let submitted = self
            .retry
            .run("submit", &ctx.cancel, |_| self.backend.submit(&request))
            .await;
        let mut retry_count = submitted.retry_count;
        let job_id = match submitted.result {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(job = job.name, error = %e, retry_count, "Batch submission failed");
                return ExecutionResult::from_error(e, retry_count);
            }
        };
        tracing::info!(job = job.name, job_id = %job_id, "Batch job submitted");
        ctx.events.info(format!("submitted batch job {job_id}"));

        let outcome = ctx
            .with_progress(self.polling.run(&ctx.cancel, |_| self.backend.status(&job_id)))
            .await;

        match outcome {
            PollOutcome::Terminal(BatchState::Success) => {}
            PollOutcome::Terminal(state) => {
                return ExecutionResult::failed(
                    format!("batch job {job_id} ended in state {state:?}"),
                    retry_count,
                );
            }
            PollOutcome::Exhausted { polls, elapsed } => {
                self.abort(&job_id).await;
                return ExecutionResult::failed(
                    format!(
                        "batch job {job_id} not finished after {polls} polls ({}s)",
                        elapsed.as_secs()
                    ),
                    retry_count,
                );
            }
            PollOutcome::Cancelled => {
                self.abort(&job_id).await;
                return ExecutionResult::cancelled(retry_count);
            }
            PollOutcome::Failed(e) => return ExecutionResult::from_error(e, retry_count),
        }

        let fetched = self
            .retry
            .run("fetch_result", &ctx.cancel, |_| self.backend.fetch_result(&job_id))
            .await;
        retry_count += fetched.retry_count;

        match fetched.result.and_then(|bytes| write_output(job, &bytes)) {
            Ok(()) => ExecutionResult::success(retry_count),
            Err(ExecutionError::Cancelled) => ExecutionResult::cancelled(retry_count),
            Err(e) => ExecutionResult::failed(e.to_string(), retry_count),
        }
    }

    async fn abort(&self, job_id: &str) {
        match tokio::time::timeout(ABORT_TIMEOUT, self.backend.abort(job_id)).await {
            Ok(Ok(())) => tracing::info!(job_id, "Batch job aborted"),
            Ok(Err(e)) => tracing::warn!(job_id, error = %e, "Failed to abort batch job"),
            Err(_) => tracing::warn!(job_id, "Abort request timed out"),
        }
    }
}
