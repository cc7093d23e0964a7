// src/api/queue.rs
//! Pending work and the per-service priority queue

use futures::future::{BoxFuture, FutureExt};
use log::{debug, error};
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error_handling::ApiFailure;
use super::retry::{run_with_retry, RetryContext};
use crate::error::GovernorError;

/// A submitted request with its result type erased so one queue can hold them all
pub(crate) trait Dispatch: Send {
    /// Run every attempt and settle the caller
    fn run(self: Box<Self>, ctx: RetryContext) -> BoxFuture<'static, ()>;

    /// Settle the caller without running the operation
    fn abandon(self: Box<Self>, error: GovernorError);
}

pub(crate) struct Job<T, F> {
    id: String,
    operation: F,
    settle: oneshot::Sender<Result<T, GovernorError>>,
}

impl<T, F> Job<T, F> {
    pub(crate) fn new(
        id: String,
        operation: F,
    ) -> (Self, oneshot::Receiver<Result<T, GovernorError>>) {
        let (settle, receiver) = oneshot::channel();
        (
            Self {
                id,
                operation,
                settle,
            },
            receiver,
        )
    }
}

impl<T, F, Fut> Dispatch for Job<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ApiFailure>> + Send + 'static,
{
    fn run(self: Box<Self>, ctx: RetryContext) -> BoxFuture<'static, ()> {
        let Job {
            id,
            mut operation,
            settle,
        } = *self;

        Box::pin(async move {
            let attempts = AssertUnwindSafe(run_with_retry(&ctx, &id, &mut operation));
            let outcome = match attempts.catch_unwind().await {
                Ok(settled) => settled.map_err(GovernorError::from),
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!("💥 {} request {} panicked: {}", ctx.service, id, message);
                    Err(GovernorError::Panicked {
                        service: ctx.service.clone(),
                        id: id.clone(),
                        message,
                    })
                }
            };
            if settle.send(outcome).is_err() {
                debug!("{} request {} settled after its caller went away", ctx.service, id);
            }
        })
    }

    fn abandon(self: Box<Self>, error: GovernorError) {
        let _ = self.settle.send(Err(error));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) struct PendingRequest {
    pub id: String,
    pub priority: i32,
    pub enqueued_at: Instant,
    pub job: Box<dyn Dispatch>,
}

/// Descending priority, FIFO among equal priorities
#[derive(Default)]
pub(crate) struct PriorityQueue {
    entries: VecDeque<PendingRequest>,
}

impl PriorityQueue {
    /// Inserts before the first entry with a strictly lower priority
    pub fn push(&mut self, request: PendingRequest) {
        let insert_pos = self
            .entries
            .iter()
            .position(|queued| queued.priority < request.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(insert_pos, request);
    }

    pub fn pop(&mut self) -> Option<PendingRequest> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingRequest> + '_ {
        self.entries.drain(..)
    }
}

/// Caller's side of a submitted request; resolves exactly once
pub struct RequestHandle<T> {
    service: String,
    id: String,
    state: HandleState<T>,
}

enum HandleState<T> {
    Pending(oneshot::Receiver<Result<T, GovernorError>>),
    Failed(Option<GovernorError>),
}

impl<T> RequestHandle<T> {
    pub(crate) fn pending(
        service: &str,
        id: String,
        receiver: oneshot::Receiver<Result<T, GovernorError>>,
    ) -> Self {
        Self {
            service: service.to_string(),
            id,
            state: HandleState::Pending(receiver),
        }
    }

    pub(crate) fn failed(service: &str, id: String, error: GovernorError) -> Self {
        Self {
            service: service.to_string(),
            id,
            state: HandleState::Failed(Some(error)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn closed(&self) -> GovernorError {
        GovernorError::Closed {
            service: self.service.clone(),
            id: self.id.clone(),
        }
    }
}

impl<T> Unpin for RequestHandle<T> {}

impl<T> Future for RequestHandle<T> {
    type Output = Result<T, GovernorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(settled)) => Poll::Ready(settled),
                Poll::Ready(Err(_)) => Poll::Ready(Err(this.closed())),
                Poll::Pending => Poll::Pending,
            },
            HandleState::Failed(error) => match error.take() {
                Some(error) => Poll::Ready(Err(error)),
                None => Poll::Ready(Err(this.closed())),
            },
        }
    }
}
