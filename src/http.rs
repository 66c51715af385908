//! JSON-over-HTTP plumbing shared by the embedding and LLM providers.
//!
//! Retry strategy:
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - HTTP 401/403 → [`CollaboratorError::Unauthorized`], no retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use docqa_core::CollaboratorError;
use reqwest::{RequestBuilder, StatusCode};
use tracing::debug;

/// Build a client with a whole-request timeout.
pub fn client(timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Other(format!("failed to build HTTP client: {}", e)))
}

/// Classify a non-success status.
pub fn status_error(label: &str, status: StatusCode, body: &str) -> CollaboratorError {
    let message = format!("{} API error {}: {}", label, status, body);
    match status.as_u16() {
        401 | 403 => CollaboratorError::Unauthorized(message),
        429 => CollaboratorError::RateLimited(message),
        s if s >= 500 => CollaboratorError::Unavailable(message),
        _ => CollaboratorError::Other(message),
    }
}

fn send_error(label: &str, e: reqwest::Error, timeout: Duration) -> CollaboratorError {
    if e.is_timeout() {
        CollaboratorError::Timeout(timeout)
    } else {
        CollaboratorError::Unavailable(format!("{} connection error: {}", label, e))
    }
}

fn retryable(status: StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// Send the request produced by `build` and decode a JSON body, retrying
/// transient failures up to `max_retries` times.
pub async fn send_json<F>(
    label: &str,
    max_retries: u32,
    timeout: Duration,
    build: F,
) -> Result<serde_json::Value, CollaboratorError>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(provider = label, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        CollaboratorError::Malformed(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body = response.text().await.unwrap_or_default();
                let err = status_error(label, status, &body);
                if retryable(status) {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(send_error(label, e, timeout));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        CollaboratorError::Unavailable(format!("{} request failed after retries", label))
    }))
}

/// Issue a single GET and report whether it succeeded.
pub async fn probe(label: &str, timeout: Duration, request: RequestBuilder) -> Result<(), CollaboratorError> {
    let response = request.send().await.map_err(|e| send_error(label, e, timeout))?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(label, status, &body))
}

/// Read a float array out of a JSON value.
pub fn float_array(value: &serde_json::Value, what: &str) -> Result<Vec<f32>, CollaboratorError> {
    value
        .as_array()
        .ok_or_else(|| CollaboratorError::Malformed(format!("{} is not an array", what)))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| CollaboratorError::Malformed(format!("{} contains a non-number", what)))
        })
        .collect()
}
