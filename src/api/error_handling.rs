// src/api/error_handling.rs
//! Failure normalization and retry classification
//!
//! Operations hand the governor an [`ApiFailure`]: either a bare network error or
//! an HTTP status with its headers. A per-service [`Classifier`] turns that into a
//! [`RetryDecision`], so the scheduler never has to know what a 429 means.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const RETRY_AFTER: &str = "retry-after";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Reset wait used when a 429 carries no usable metadata
pub const DEFAULT_RATE_LIMIT_RESET: Duration = Duration::from_secs(60);

/// Normalized failure shape produced by an operation
#[derive(Debug, Clone, PartialEq)]
pub struct ApiFailure {
    status: Option<u16>,
    headers: HashMap<String, String>,
    message: String,
}

impl ApiFailure {
    /// Failure with no response at all (DNS, connect, reset, ...)
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            headers: HashMap::new(),
            message: message.into(),
        }
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            headers: HashMap::new(),
            message: message.into(),
        }
    }

    /// Attach a response header; names are matched case-insensitively
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> FailureKind {
        match self.status {
            None => FailureKind::NetworkFailure,
            Some(429) => FailureKind::RateLimited,
            Some(408) => FailureKind::RequestTimeout,
            Some(425) => FailureKind::TooEarly,
            Some(500..=599) => FailureKind::ServerError,
            Some(_) => FailureKind::ClientError,
        }
    }

    /// Build from a received reqwest response, keeping every readable header
    pub fn from_response(response: &reqwest::Response) -> Self {
        let message = response
            .status()
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string();
        Self::from_parts(response.status(), response.headers(), message)
    }

    pub fn from_parts(
        status: reqwest::StatusCode,
        headers: &reqwest::header::HeaderMap,
        message: impl Into<String>,
    ) -> Self {
        let mut failure = Self::status(status.as_u16(), message);
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                failure = failure.with_header(name.as_str(), value);
            }
        }
        failure
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "HTTP {}: {}", code, self.message),
            None => write!(f, "Network Error: {}", self.message),
        }
    }
}

impl std::error::Error for ApiFailure {}

impl From<reqwest::Error> for ApiFailure {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::status(status.as_u16(), err.to_string()),
            None => Self::network(err.to_string()),
        }
    }
}

/// Error taxonomy derived from the normalized shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NetworkFailure, // no response metadata
    RateLimited,    // 429
    ServerError,    // 5xx
    RequestTimeout, // 408
    TooEarly,       // 425
    ClientError,    // anything else
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::ClientError)
    }
}

/// What the retry executor should do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    Fatal,
    /// Retry, but wait this long on top of the regular backoff
    RetryableWithExtraDelay(Duration),
}

pub type Classifier = Arc<dyn Fn(&ApiFailure) -> RetryDecision + Send + Sync>;

/// Wrap a plain function or closure as a [`Classifier`]
pub fn classifier<F>(f: F) -> Classifier
where
    F: Fn(&ApiFailure) -> RetryDecision + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Default classifier for HTTP-backed services
pub fn http_status_classifier() -> Classifier {
    classifier(classify_http_failure)
}

pub fn classify_http_failure(failure: &ApiFailure) -> RetryDecision {
    match failure.kind() {
        FailureKind::RateLimited => {
            let delay = rate_limit_reset_delay(failure, Utc::now().timestamp_millis());
            debug!("Rate limited ({}), reset wait {:?}", failure, delay);
            RetryDecision::RetryableWithExtraDelay(delay)
        }
        kind if kind.is_retryable() => RetryDecision::Retryable,
        _ => RetryDecision::Fatal,
    }
}

/// Reset wait for a rate-limited failure.
///
/// `retry-after` wins (delay-seconds or HTTP-date), then `x-ratelimit-reset`
/// (epoch seconds), then [`DEFAULT_RATE_LIMIT_RESET`].
pub fn rate_limit_reset_delay(failure: &ApiFailure, now_epoch_ms: i64) -> Duration {
    if let Some(delay) = failure
        .header(RETRY_AFTER)
        .and_then(|value| parse_retry_after(value, now_epoch_ms))
    {
        return delay;
    }

    if let Some(reset_secs) = failure
        .header(X_RATELIMIT_RESET)
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite())
    {
        let remaining_ms = reset_secs * 1000.0 - now_epoch_ms as f64;
        return Duration::from_millis(remaining_ms.max(0.0) as u64);
    }

    DEFAULT_RATE_LIMIT_RESET
}

fn parse_retry_after(value: &str, now_epoch_ms: i64) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs.max(0.0)).ok();
    }
    DateTime::parse_from_rfc2822(value).ok().map(|at| {
        let remaining_ms = at.timestamp_millis() - now_epoch_ms;
        Duration::from_millis(remaining_ms.max(0) as u64)
    })
}
