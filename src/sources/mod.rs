//! External data source adapters.
//!
//! Each adapter is an independent failure domain: recoverable remote trouble
//! comes back as empty-or-partial results, and only genuinely unrecoverable
//! conditions (bad credentials, misconfiguration) surface as typed errors
//! for the orchestrator to record and step past.
//!
//! Modules:
//! - analytics: GA4 Data API page metrics with period comparison
//! - search: Search Console query/page performance
//! - speed: PageSpeed Insights audits (expensive, rate-limited)
//! - cms: HubSpot CMS page inventory and forms
//! - links: sitemap sweep and redirect-chain link checking

pub mod analytics;
pub mod cms;
pub mod links;
pub mod search;
pub mod speed;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed payload: {0}")]
    Data(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Retry behavior for remote calls: 429 and 5xx back off and retry, anything
/// else returns immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Send a request, retrying transient failures with exponential backoff.
///
/// The builder is cloned per attempt; a non-cloneable builder (streaming
/// body) gets exactly one attempt.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, SourceError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let this_try = match request.try_clone() {
            Some(cloned) => cloned,
            None => return Ok(request.send().await?),
        };

        match this_try.send().await {
            Ok(resp) => {
                let status = resp.status();
                let transient = status.as_u16() == 429 || status.is_server_error();
                if transient && attempt < policy.max_attempts {
                    let delay = policy.base_delay * 2u32.pow(attempt - 1);
                    log::debug!("Retrying after HTTP {} (attempt {})", status, attempt);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if attempt < policy.max_attempts {
                    let delay = policy.base_delay * 2u32.pow(attempt - 1);
                    log::debug!("Retrying after network error: {} (attempt {})", e, attempt);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(SourceError::Http(e));
            }
        }
    }
}

/// Map a non-success response to `SourceError::Api`, draining the body for
/// the message.
pub async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(SourceError::Api {
        status: status.as_u16(),
        message: crate::util::truncate(&message, 500),
    })
}

/// Await a future under a timeout, mapping elapsed time to `SourceError`.
pub async fn bounded<T, F>(cap: Duration, fut: F) -> Result<T, SourceError>
where
    F: std::future::Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(cap, fut).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(cap)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), SourceError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SourceError::Timeout(_))));
    }
}
