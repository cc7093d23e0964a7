// src/api/scheduler.rs
//! Per-service lane: queue, admission gate, concurrency count, and the single
//! worker task that drains them.
//!
//! The worker is the only consumer of its lane's queue. It parks on a `Notify`
//! that submissions, completions, config updates and resets all signal, and
//! sleeps exactly until the next admission instant when the gate refuses.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

use super::error_handling::Classifier;
use super::manager::ServiceStats;
use super::queue::{PendingRequest, PriorityQueue};
use super::rate_limiter::{Admission, AdmissionGate};
use super::retry::{RetryContext, RetryPolicy};
use crate::config::{ServiceConfig, ServiceConfigUpdate};
use crate::error::{GovernorError, Result};

pub(crate) struct LaneState {
    pub config: ServiceConfig,
    pub classifier: Classifier,
    pub queue: PriorityQueue,
    pub active: usize,
    pub gate: AdmissionGate,
    /// Bumped by reset so completions from before it don't touch the new count
    pub generation: u64,
}

pub(crate) struct ServiceLane {
    name: String,
    state: Mutex<LaneState>,
    wake: Notify,
    worker_started: AtomicBool,
    closed: AtomicBool,
}

enum Step {
    Dispatch {
        request: PendingRequest,
        ctx: RetryContext,
        generation: u64,
    },
    Wait(Duration),
    Idle,
}

impl ServiceLane {
    pub fn new(name: &str, config: ServiceConfig, classifier: Classifier) -> Self {
        let gate = AdmissionGate::new(&config, Instant::now());
        Self {
            name: name.to_string(),
            state: Mutex::new(LaneState {
                config,
                classifier,
                queue: PriorityQueue::default(),
                active: 0,
                gate,
                generation: 0,
            }),
            wake: Notify::new(),
            worker_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lane state; a panic elsewhere never leaves the counters half-written
    pub fn state(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Spawns the lane worker onto the current runtime when none is running.
    /// A worker whose runtime shut down is replaced on the next call.
    pub fn ensure_worker(self: &Arc<Self>) -> Result<()> {
        if self.worker_started.load(Ordering::Acquire) {
            return Ok(());
        }
        let handle = Handle::try_current().map_err(|_| GovernorError::NoRuntime {
            service: self.name.clone(),
        })?;
        if !self.worker_started.swap(true, Ordering::AcqRel) {
            debug!("🧵 Starting scheduler for {}", self.name);
            handle.spawn(run_lane(Arc::clone(self)));
        }
        Ok(())
    }

    pub fn enqueue(&self, request: PendingRequest) {
        {
            let mut state = self.state();
            debug!(
                "📝 Queued priority {} request {} for {} (queue size: {})",
                request.priority,
                request.id,
                self.name,
                state.queue.len() + 1
            );
            state.queue.push(request);
        }
        self.notify();
    }

    fn abandon<E>(&self, requests: Vec<PendingRequest>, make_error: E) -> usize
    where
        E: Fn(&str) -> GovernorError,
    {
        let count = requests.len();
        for request in requests {
            let error = make_error(&request.id);
            request.job.abandon(error);
        }
        count
    }

    /// Stops the worker; anything still queued settles with `Closed`
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let queued: Vec<PendingRequest> = self.state().queue.drain().collect();
            let count = self.abandon(queued, |id| GovernorError::Closed {
                service: self.name.clone(),
                id: id.to_string(),
            });
            if count > 0 {
                warn!("🛑 {} closed with {} queued requests", self.name, count);
            }
            self.notify();
        }
    }

    /// Merges `update` into the live config; queue, bucket and window are untouched
    pub fn update_config(&self, update: &ServiceConfigUpdate) -> Result<ServiceConfig> {
        let merged = {
            let mut state = self.state();
            let merged = state.config.merged(update);
            merged.validate(&self.name)?;
            state.config = merged.clone();
            merged
        };
        self.notify();
        Ok(merged)
    }

    pub fn set_classifier(&self, classifier: Classifier) {
        self.state().classifier = classifier;
    }

    /// Back to a fresh lane: empty queue, zero active, full bucket, empty window.
    /// Queued requests settle with `Cancelled`; in-flight ones keep running.
    pub fn reset(&self) -> usize {
        let queued: Vec<PendingRequest> = {
            let mut state = self.state();
            let config = state.config.clone();
            state.gate.reset(&config, Instant::now());
            state.active = 0;
            state.generation += 1;
            let queued = state.queue.drain().collect();
            queued
        };

        let count = self.abandon(queued, |id| GovernorError::Cancelled {
            service: self.name.clone(),
            id: id.to_string(),
        });
        self.notify();
        count
    }

    pub fn stats(&self) -> ServiceStats {
        let now = Instant::now();
        let mut state = self.state();
        let config = state.config.clone();
        ServiceStats {
            queue_length: state.queue.len(),
            active_requests: state.active,
            recent_request_count: state.gate.recent_count(now),
            tokens: state.gate.tokens(&config, now),
            config,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_step(&self, now: Instant) -> Step {
        let mut state = self.state();
        if state.queue.is_empty() || state.active >= state.config.max_concurrent {
            return Step::Idle;
        }

        let config = state.config.clone();
        if let Admission::Denied { retry_after } = state.gate.check(&config, now) {
            return Step::Wait(retry_after);
        }

        let Some(request) = state.queue.pop() else {
            return Step::Idle;
        };
        state.active += 1;
        Step::Dispatch {
            request,
            ctx: RetryContext {
                service: self.name.clone(),
                policy: RetryPolicy::from(&config),
                classifier: Arc::clone(&state.classifier),
            },
            generation: state.generation,
        }
    }

    fn complete(&self, generation: u64) {
        {
            let mut state = self.state();
            if state.generation == generation {
                state.active = state.active.saturating_sub(1);
            }
        }
        self.notify();
    }
}

/// Releases a dispatch slot however the request ends, panics included
struct ActiveSlot {
    lane: Arc<ServiceLane>,
    generation: u64,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.lane.complete(self.generation);
    }
}

/// Marks the lane workerless once its task ends or its runtime drops it,
/// so the next submission spawns a fresh worker
struct WorkerRunning {
    lane: Arc<ServiceLane>,
}

impl Drop for WorkerRunning {
    fn drop(&mut self) {
        self.lane.worker_started.store(false, Ordering::Release);
        debug!("Scheduler for {} released", self.lane.name());
    }
}

async fn run_lane(lane: Arc<ServiceLane>) {
    let _running = WorkerRunning {
        lane: Arc::clone(&lane),
    };
    info!("🚦 Scheduler running for {}", lane.name());

    while !lane.is_closed() {
        match lane.next_step(Instant::now()) {
            Step::Dispatch {
                request,
                ctx,
                generation,
            } => {
                debug!(
                    "✅ Dispatching {} request {} (priority {}, queued {:?})",
                    lane.name(),
                    request.id,
                    request.priority,
                    request.enqueued_at.elapsed()
                );
                let slot = ActiveSlot {
                    lane: Arc::clone(&lane),
                    generation,
                };
                tokio::spawn(async move {
                    let _slot = slot;
                    request.job.run(ctx).await;
                });
            }
            Step::Wait(delay) => {
                debug!("⏳ {} admission refused, next slot in {:?}", lane.name(), delay);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = lane.wake.notified() => {}
                }
            }
            Step::Idle => lane.wake.notified().await,
        }
    }

    debug!("Scheduler for {} stopped", lane.name());
}
