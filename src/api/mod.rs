// src/api/mod.rs
//! Outbound request governor
//!
//! Per-service throttling for calls to the debrid APIs:
//! - token bucket + one-minute sliding window + minimum spacing admission
//! - priority queuing with FIFO tie-breaking
//! - bounded concurrency per service
//! - retries with exponential backoff, jitter and rate-limit reset waits

pub mod error_handling;
pub mod manager;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
mod scheduler;

pub use error_handling::{
    classifier, classify_http_failure, http_status_classifier, rate_limit_reset_delay,
    ApiFailure, Classifier, FailureKind, RetryDecision,
};

pub use manager::{BatchRequest, BoxedOperation, RequestGovernor, ServiceStats};

pub use queue::RequestHandle;

pub use rate_limiter::{Admission, AdmissionGate, AdmissionWindow, TokenBucket};

pub use retry::{RetryContext, RetryPolicy};
