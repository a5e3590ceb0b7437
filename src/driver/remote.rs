//! Shared HTTP plumbing for the object-store backends: per-request timeout and a
//! bounded retry on connection failures only.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use tracing::warn;

use super::{DriverError, DriverResult};
use crate::config::StorageSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(3_000), retries: 1, backoff: Duration::from_millis(1_000) }
    }
}

impl RetryPolicy {
    pub fn from_settings(s: &StorageSettings) -> Self {
        Self {
            timeout: Duration::from_millis(s.timeout_ms),
            retries: s.retries,
            backoff: Duration::from_millis(s.retry_backoff_ms),
        }
    }
}

pub fn build_client(policy: &RetryPolicy) -> DriverResult<Client> {
    Client::builder()
        .timeout(policy.timeout)
        .build()
        .map_err(|e| DriverError::Config(format!("http client: {}", e)))
}

fn transport(key: &str, e: &reqwest::Error) -> DriverError {
    DriverError::Transport { key: key.to_string(), message: e.to_string(), transient: e.is_connect() }
}

/// Send a request built fresh by `build` for every attempt. Only connection failures are
/// retried; timeouts and HTTP error statuses are returned as they are.
pub async fn send<F>(policy: &RetryPolicy, key: &str, build: F) -> DriverResult<Response>
where
    F: Fn() -> DriverResult<RequestBuilder>,
{
    let mut attempt = 0u32;
    loop {
        match build()?.send().await {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_connect() && attempt < policy.retries => {
                attempt += 1;
                warn!(target: "fileplane::driver", key, attempt, "connection failed, retrying: {}", e);
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(transport(key, &e)),
        }
    }
}

/// Map a non-success response to a driver error; 404 becomes `NotFound`.
pub async fn check(key: &str, resp: Response) -> DriverResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 404 {
        return Err(DriverError::NotFound(key.to_string()));
    }
    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(512).collect();
    Err(DriverError::Http { key: key.to_string(), status: status.as_u16(), body })
}

pub async fn bytes(key: &str, resp: Response) -> DriverResult<Vec<u8>> {
    resp.bytes().await.map(|b| b.to_vec()).map_err(|e| transport(key, &e))
}

pub async fn text(key: &str, resp: Response) -> DriverResult<String> {
    resp.text().await.map_err(|e| transport(key, &e))
}
