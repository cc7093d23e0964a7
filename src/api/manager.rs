// src/api/manager.rs
//! Central request governor
//!
//! One `RequestGovernor` per process, cloned into every call site that talks to
//! a debrid service. Each registered service gets its own independent lane, so
//! backpressure on one never slows another.

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt};
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

use super::error_handling::{http_status_classifier, ApiFailure, Classifier};
use super::queue::{Job, PendingRequest, RequestHandle};
use super::scheduler::ServiceLane;
use crate::config::{default_services, GovernorSettings, ServiceConfig, ServiceConfigUpdate};
use crate::error::{GovernorError, Result};

/// Point-in-time view of one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStats {
    pub queue_length: usize,
    pub active_requests: usize,
    pub recent_request_count: usize,
    pub tokens: f64,
    pub config: ServiceConfig,
}

impl fmt::Display for ServiceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue:{}, active:{}/{}, last minute:{}/{}, tokens:{:.2}/{}",
            self.queue_length,
            self.active_requests,
            self.config.max_concurrent,
            self.recent_request_count,
            self.config.max_requests_per_minute,
            self.tokens,
            self.config.burst_size
        )
    }
}

pub type BoxedOperation<T> =
    Box<dyn FnMut() -> BoxFuture<'static, std::result::Result<T, ApiFailure>> + Send>;

/// One entry of a batch submission
pub struct BatchRequest<T> {
    pub id: String,
    pub priority: i32,
    operation: BoxedOperation<T>,
}

impl<T: Send + 'static> BatchRequest<T> {
    pub fn new<F, Fut>(id: impl Into<String>, mut operation: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, ApiFailure>> + Send + 'static,
    {
        Self {
            id: id.into(),
            priority: 0,
            operation: Box::new(move || operation().boxed()),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

struct GovernorInner {
    lanes: DashMap<String, Arc<ServiceLane>>,
}

impl Drop for GovernorInner {
    fn drop(&mut self) {
        for lane in self.lanes.iter() {
            lane.value().close();
        }
    }
}

/// Throttles, queues and retries outbound calls per service
#[derive(Clone)]
pub struct RequestGovernor {
    inner: Arc<GovernorInner>,
}

impl RequestGovernor {
    /// Governor with no services registered
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GovernorInner {
                lanes: DashMap::new(),
            }),
        }
    }

    /// Governor with the stock debrid services and the HTTP classifier
    pub fn with_default_services() -> Self {
        let governor = Self::new();
        for (name, config) in default_services() {
            governor.insert_lane(&name, config, http_status_classifier());
        }
        governor
    }

    pub fn from_settings(settings: &GovernorSettings) -> Result<Self> {
        let governor = Self::new();
        for (name, config) in &settings.services {
            governor.register_service(name, config.clone())?;
        }
        Ok(governor)
    }

    pub fn register_service(&self, name: &str, config: ServiceConfig) -> Result<()> {
        self.register_service_with_classifier(name, config, http_status_classifier())
    }

    /// Registers `name`, or replaces the config and classifier of an existing
    /// service while keeping its queue, bucket and window.
    pub fn register_service_with_classifier(
        &self,
        name: &str,
        config: ServiceConfig,
        classifier: Classifier,
    ) -> Result<()> {
        config.validate(name)?;
        if let Some(lane) = self.lane(name) {
            {
                let mut state = lane.state();
                state.config = config;
                state.classifier = classifier;
            }
            lane.notify();
            info!("🔧 Re-registered service {}", name);
            return Ok(());
        }
        self.insert_lane(name, config, classifier);
        Ok(())
    }

    fn insert_lane(&self, name: &str, config: ServiceConfig, classifier: Classifier) {
        info!(
            "🚦 Registering {}: {}req/m, {} concurrent, burst {}, {} retries",
            name,
            config.max_requests_per_minute,
            config.max_concurrent,
            config.burst_size,
            config.retry_attempts
        );
        self.inner.lanes.insert(
            name.to_string(),
            Arc::new(ServiceLane::new(name, config, classifier)),
        );
    }

    pub fn set_classifier(&self, service: &str, classifier: Classifier) -> Result<()> {
        self.require_lane(service)?.set_classifier(classifier);
        Ok(())
    }

    /// Registered service names, sorted
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lanes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn lane(&self, service: &str) -> Option<Arc<ServiceLane>> {
        self.inner.lanes.get(service).map(|lane| Arc::clone(lane.value()))
    }

    fn require_lane(&self, service: &str) -> Result<Arc<ServiceLane>> {
        self.lane(service)
            .ok_or_else(|| GovernorError::UnknownService(service.to_string()))
    }

    /// Submit at priority 0
    pub fn submit<T, F, Fut>(
        &self,
        service: &str,
        id: impl Into<String>,
        operation: F,
    ) -> RequestHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, ApiFailure>> + Send + 'static,
    {
        self.submit_with_priority(service, id, operation, 0)
    }

    /// Queues `operation` on `service`. Higher priorities dispatch first; equal
    /// priorities dispatch in submission order. The handle resolves once, with the
    /// operation's value or its final failure.
    pub fn submit_with_priority<T, F, Fut>(
        &self,
        service: &str,
        id: impl Into<String>,
        operation: F,
        priority: i32,
    ) -> RequestHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, ApiFailure>> + Send + 'static,
    {
        let id = id.into();
        let lane = match self.require_lane(service) {
            Ok(lane) => lane,
            Err(e) => {
                warn!("Rejected request {}: {}", id, e);
                return RequestHandle::failed(service, id, e);
            }
        };
        if let Err(e) = lane.ensure_worker() {
            return RequestHandle::failed(service, id, e);
        }

        let (job, receiver) = Job::new(id.clone(), operation);
        lane.enqueue(PendingRequest {
            id: id.clone(),
            priority,
            enqueued_at: Instant::now(),
            job: Box::new(job),
        });
        RequestHandle::pending(service, id, receiver)
    }

    /// Submits every request independently and collects each outcome by id.
    /// The returned future never fails; per-request failures are map values.
    pub fn submit_batch<T>(
        &self,
        service: &str,
        requests: Vec<BatchRequest<T>>,
    ) -> impl Future<Output = HashMap<String, Result<T>>> + Send + 'static
    where
        T: Send + 'static,
    {
        let handles: Vec<RequestHandle<T>> = requests
            .into_iter()
            .map(|request| {
                self.submit_with_priority(service, request.id, request.operation, request.priority)
            })
            .collect();

        async move {
            let ids: Vec<String> = handles.iter().map(|h| h.id().to_string()).collect();
            let outcomes = join_all(handles).await;
            ids.into_iter().zip(outcomes).collect()
        }
    }

    pub fn update_config(&self, service: &str, update: ServiceConfigUpdate) -> Result<()> {
        let merged = self.require_lane(service)?.update_config(&update)?;
        info!("🔧 Updated {} config: {:?}", service, merged);
        Ok(())
    }

    pub fn stats(&self, service: &str) -> Result<ServiceStats> {
        Ok(self.require_lane(service)?.stats())
    }

    pub fn all_stats(&self) -> BTreeMap<String, ServiceStats> {
        let lanes: Vec<Arc<ServiceLane>> =
            self.inner.lanes.iter().map(|e| Arc::clone(e.value())).collect();
        lanes
            .into_iter()
            .map(|lane| (lane.name().to_string(), lane.stats()))
            .collect()
    }

    /// Reinitializes one service. Queued requests settle with `Cancelled`.
    pub fn reset(&self, service: &str) -> Result<()> {
        let cancelled = self.require_lane(service)?.reset();
        info!("♻️ Reset {} ({} queued requests cancelled)", service, cancelled);
        Ok(())
    }

    pub fn reset_all(&self) {
        for service in self.services() {
            if let Err(e) = self.reset(&service) {
                warn!("Reset skipped: {}", e);
            }
        }
    }
}

impl Default for RequestGovernor {
    fn default() -> Self {
        Self::with_default_services()
    }
}
