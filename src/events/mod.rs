//! In-process publish/subscribe bus for instance lifecycle events.
//!
//! Publishing only enqueues: handlers run on a dispatcher task per event kind,
//! so a slow or failing subscriber never delays the lifecycle call that
//! produced the event. Within one kind, an event is fully handled before the
//! next one is taken off the queue, which keeps delivery in publish order.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::provider::{InstanceConfig, InstanceInfo};

const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 16;

/// Kind of lifecycle event.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum EventKind {
    /// Instances were created and are ready.
    Created,
    /// Instances were deleted and confirmed absent.
    Deleted,
}

impl EventKind {
    /// Every kind, in dispatcher start order.
    pub const ALL: [Self; 2] = [Self::Created, Self::Deleted];

    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "instance.created",
            Self::Deleted => "instance.deleted",
        }
    }
}

/// Identity of the job that triggered a lifecycle operation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobRef {
    /// Job identifier.
    pub id: u64,
    /// Human readable job name.
    pub name: String,
    /// Identifier of the job owner.
    pub owner_id: u64,
}

impl JobRef {
    /// Creates a job reference.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>, owner_id: u64) -> Self {
        Self {
            id,
            name: name.into(),
            owner_id,
        }
    }
}

/// Notification published after a lifecycle operation completes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// Event kind.
    pub kind: EventKind,
    /// Originating job identifier.
    pub job_id: u64,
    /// Originating job name.
    pub job_name: String,
    /// Owner of the originating job.
    pub owner_id: u64,
    /// Instances affected by the operation.
    pub instances: Vec<InstanceInfo>,
    /// Requests that produced the instances. Empty for deletions.
    pub requests: Vec<InstanceConfig>,
}

impl Event {
    /// Builds a [`EventKind::Created`] event.
    #[must_use]
    pub fn created(job: &JobRef, instances: Vec<InstanceInfo>, requests: Vec<InstanceConfig>) -> Self {
        Self::new(EventKind::Created, job, instances, requests)
    }

    /// Builds a [`EventKind::Deleted`] event.
    #[must_use]
    pub fn deleted(job: &JobRef, instances: Vec<InstanceInfo>) -> Self {
        Self::new(EventKind::Deleted, job, instances, Vec::new())
    }

    fn new(
        kind: EventKind,
        job: &JobRef,
        instances: Vec<InstanceInfo>,
        requests: Vec<InstanceConfig>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            job_id: job.id,
            job_name: job.name.clone(),
            owner_id: job.owner_id,
            instances,
            requests,
        }
    }
}

/// Failure reported by an [`EventHandler`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ProviderError> for HandlerError {
    fn from(value: ProviderError) -> Self {
        Self::new(value.to_string())
    }
}

/// Future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Subscriber reacting to lifecycle events.
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handles one event. The handler owns its copy; `cancel` fires when the
    /// bus is aborted.
    fn handle<'a>(&'a self, cancel: &'a CancellationToken, event: Event) -> HandlerFuture<'a>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, cancel: &'a CancellationToken, event: Event) -> HandlerFuture<'a> {
        Box::pin((self.f)(cancel.clone(), event))
    }
}

/// Wraps an async closure as an [`EventHandler`].
#[must_use]
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(CancellationToken, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Capacity limits for an [`EventBus`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventBusConfig {
    /// Events buffered per kind before `publish` waits.
    pub queue_capacity: usize,
    /// Handlers allowed to run at once across all kinds.
    pub max_concurrent_handlers: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }
}

/// Errors raised by the [`EventBus`].
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum EventBusError {
    /// The bus was shut down or aborted.
    #[error("event bus is closed")]
    Closed,
}

type HandlerMap = HashMap<EventKind, Vec<Arc<dyn EventHandler>>>;

struct BusInner {
    senders: Mutex<Option<HashMap<EventKind, mpsc::Sender<Event>>>>,
    handlers: Arc<RwLock<HandlerMap>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// Bounded, in-process event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    /// Starts one dispatcher task per [`EventKind`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: EventBusConfig) -> Self {
        let handlers: Arc<RwLock<HandlerMap>> = Arc::new(RwLock::new(HashMap::new()));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1)));
        let cancel = CancellationToken::new();
        let mut senders = HashMap::new();
        let mut dispatchers = Vec::new();

        for kind in EventKind::ALL {
            let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
            senders.insert(kind, sender);
            dispatchers.push(tokio::spawn(dispatch(
                kind,
                receiver,
                Arc::clone(&handlers),
                Arc::clone(&semaphore),
                cancel.clone(),
            )));
        }

        Self {
            inner: Arc::new(BusInner {
                senders: Mutex::new(Some(senders)),
                handlers,
                dispatchers: Mutex::new(dispatchers),
                cancel,
            }),
        }
    }

    /// Registers `handler` for events of `kind`. Events already queued are
    /// delivered to it if they have not been dispatched yet.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        debug!(kind = kind.as_str(), handler = handler.name(), "subscribing handler");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Enqueues `event` for its kind's dispatcher. Waits only for queue
    /// capacity, never for handlers.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Closed`] once the bus was shut down.
    pub async fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .inner
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|senders| senders.get(&event.kind).cloned())
            .ok_or(EventBusError::Closed)?;
        debug!(event_id = %event.id, kind = event.kind.as_str(), "publishing event");
        sender.send(event).await.map_err(|_| EventBusError::Closed)
    }

    /// Stops accepting events and waits until every queued event has been
    /// handled.
    pub async fn shutdown(&self) {
        self.close();
        let dispatchers = std::mem::take(
            &mut *self
                .inner
                .dispatchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for dispatcher in dispatchers {
            if let Err(err) = dispatcher.await {
                warn!(error = %err, "event dispatcher ended abnormally");
            }
        }
    }

    /// Stops accepting events, cancels running handlers and drops queued
    /// events.
    pub fn abort(&self) {
        self.close();
        self.inner.cancel.cancel();
        for dispatcher in self
            .inner
            .dispatchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            dispatcher.abort();
        }
    }

    fn close(&self) {
        self.inner
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

async fn dispatch(
    kind: EventKind,
    mut receiver: mpsc::Receiver<Event>,
    handlers: Arc<RwLock<HandlerMap>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    while let Some(event) = receiver.recv().await {
        let subscribed = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        if subscribed.is_empty() {
            debug!(event_id = %event.id, kind = kind.as_str(), "no handlers subscribed");
            continue;
        }

        let mut running = JoinSet::new();
        for handler in subscribed {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                acquired = Arc::clone(&semaphore).acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let token = cancel.child_token();
            let copy = event.clone();
            running.spawn(async move {
                let _permit = permit;
                let result = handler.handle(&token, copy).await;
                (handler.name().to_owned(), result)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((handler, Ok(()))) => {
                    debug!(event_id = %event.id, kind = kind.as_str(), handler = %handler, "handler finished");
                }
                Ok((handler, Err(err))) => {
                    warn!(
                        event_id = %event.id,
                        kind = kind.as_str(),
                        handler = %handler,
                        error = %err,
                        "event handler failed"
                    );
                }
                Err(err) if err.is_panic() => {
                    error!(event_id = %event.id, kind = kind.as_str(), "event handler panicked");
                }
                Err(err) => {
                    debug!(event_id = %event.id, error = %err, "event handler cancelled");
                }
            }
        }
    }
    debug!(kind = kind.as_str(), "event dispatcher stopped");
}
