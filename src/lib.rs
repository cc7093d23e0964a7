pub mod api;
pub mod config;
pub mod error;
pub mod utils;

pub use api::{
    ApiFailure, BatchRequest, Classifier, FailureKind, RequestGovernor, RequestHandle,
    RetryDecision, ServiceStats,
};
pub use config::{GovernorSettings, ServiceConfig, ServiceConfigUpdate};
pub use error::{GovernorError, Result};
