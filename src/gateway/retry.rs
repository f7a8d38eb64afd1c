//! Retry with exponential backoff for upstream tool requests

use crate::config::RetryConfig;
use crate::error::{GatewayError, Result};
use crate::guardian::find_guardian_error;
use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Statuses retried by default
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504, 509, 521, 522, 523, 524];

/// Retry policy for upstream requests
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub retryable_statuses: Vec<u16>,
    pub retryable_methods: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            retryable_methods: vec!["GET".to_string()],
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            backoff_multiplier: config.backoff_multiplier,
            retryable_statuses: config.retryable_status_codes.clone(),
            retryable_methods: config.retryable_methods.clone(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (0 for the first retry), capped at `max_interval`
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.initial_interval.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        let capped = base.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn method_retryable(&self, method: &Method) -> bool {
        self.retryable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    pub fn status_retryable(&self, method: &Method, status: u16) -> bool {
        self.method_retryable(method) && self.retryable_statuses.contains(&status)
    }

    /// Delay before retry number `retry` after `response`, honouring `Retry-After`
    pub fn delay_for(&self, retry: u32, response: Option<&reqwest::Response>) -> Duration {
        let hinted = response
            .and_then(|r| r.headers().get(RETRY_AFTER))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, SystemTime::now()));
        match hinted {
            Some(hint) => hint.min(self.max_interval),
            None => self.backoff(retry),
        }
    }

    /// Run `attempt` until it succeeds, is not retryable, or attempts run out.
    ///
    /// After the last attempt the final response is returned whatever its
    /// status. A retry whose delay would pass `deadline` is skipped.
    pub async fn execute<F, Fut>(
        &self,
        method: &Method,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        mut attempt: F,
    ) -> Result<reqwest::Response>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let mut number = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(GatewayError::cancelled("tool call cancelled"));
                }
                outcome = attempt(number) => outcome,
            };
            number += 1;
            let last = number >= self.max_attempts;

            let retry = match &outcome {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    (!last && self.status_retryable(method, status))
                        .then(|| self.delay_for(number - 1, Some(resp)))
                }
                Err(e) if last || find_guardian_error(e).is_some() => None,
                Err(e) => {
                    warn!(error = %e, attempt = number, "upstream request failed, retrying");
                    Some(self.delay_for(number - 1, None))
                }
            };
            let Some(delay) = retry else {
                return outcome.map_err(|e| execute_error(&e));
            };

            if let Some(deadline) = deadline {
                if Instant::now() + delay > deadline {
                    debug!(delay_ms = delay.as_millis() as u64, "retry would exceed deadline");
                    return outcome.map_err(|e| execute_error(&e));
                }
            }

            debug!(attempt = number, delay_ms = delay.as_millis() as u64, "retrying upstream request");
            drop(outcome);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(GatewayError::cancelled("tool call cancelled during retry backoff"));
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

fn execute_error(err: &reqwest::Error) -> GatewayError {
    if let Some(guardian) = find_guardian_error(err) {
        let message = format!("failed to execute request: {}", guardian);
        return match guardian.guardian_kind() {
            Some(crate::error::GuardianErrorKind::BadHost) => GatewayError::bad_host(message),
            _ => GatewayError::blocked_ip(message),
        };
    }
    GatewayError::gateway(format!("failed to execute request: {}", err))
}

/// `Retry-After` as positive integer seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return (secs > 0).then(|| Duration::from_secs(secs as u64));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let at = SystemTime::from(date.with_timezone(&chrono::Utc));
    at.duration_since(now).ok().filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
    }

    #[test]
    fn test_only_get_statuses_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.status_retryable(&Method::GET, 429));
        assert!(policy.status_retryable(&Method::GET, 524));
        assert!(!policy.status_retryable(&Method::GET, 404));
        assert!(!policy.status_retryable(&Method::POST, 503));
    }

    #[test]
    fn test_retry_after_forms() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        assert_eq!(parse_retry_after("2", now), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("0", now), None);
        assert_eq!(parse_retry_after("-1", now), None);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:10 GMT", now),
            Some(Duration::from_secs(10))
        );
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:27:00 GMT", now), None);
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig::default();
        assert_eq!(RetryPolicy::from(&config), RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_cancel_before_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = reqwest::Client::new();
        let err = RetryPolicy::default()
            .execute(&Method::GET, &cancel, None, |_| client.get("http://127.0.0.1:9/").send())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled { .. }));
    }
}
