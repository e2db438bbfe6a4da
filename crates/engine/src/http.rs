//! Shared plumbing for the reqwest-backed engine clients.

use std::time::Duration;

use crate::error::{EngineError, ExecutionError};

/// Errors from an engine HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl HttpError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { status, .. } => matches!(status, 408 | 425 | 429) || *status >= 500,
        }
    }

    fn is_auth(&self) -> bool {
        matches!(self, Self::Api { status: 401 | 403, .. })
    }
}

impl From<HttpError> for ExecutionError {
    fn from(e: HttpError) -> Self {
        if e.is_transient() {
            ExecutionError::Transient(e.to_string())
        } else if e.is_auth() {
            ExecutionError::Fatal(format!("{e}; re-authenticate with the remote service"))
        } else {
            ExecutionError::Fatal(e.to_string())
        }
    }
}

/// Build a client with a per-request timeout.
pub fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client, EngineError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// Join a base URL and a path without doubling the slash.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Return the response unchanged on success, or an [`HttpError::Api`]
/// carrying the status and body text.
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, HttpError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(HttpError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Parse a successful JSON response body into the expected type.
pub async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, HttpError> {
    let response = ensure_success(response).await?;
    Ok(response.json::<T>().await?)
}

/// Read a successful response body as raw bytes.
pub async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, HttpError> {
    let response = ensure_success(response).await?;
    Ok(response.bytes().await?.to_vec())
}
