//! Consumer groups
//!
//! A `ConsumerGroup` runs a fixed number of tokio workers against one queue
//! (a point-to-point queue or a topic subscription's backlog). Each worker
//! leases a single message, runs the handler, and settles the lease from the
//! outcome:
//!
//! - `Ok(())` acks the message and records it as processed
//! - `HandlerError::Retry` nacks it; the queue retries or dead-letters
//! - `HandlerError::Reject` dead-letters it straight away
//! - a panicking handler is treated like `Retry`, never dropped
//!
//! Workers that find the queue empty wait for an enqueue notification or the
//! poll interval, whichever comes first. The poll interval is what picks up
//! expired leases and elapsed backoff delays.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::idempotency::IdempotencyRegistry;
use crate::broker::message::Message;
use crate::broker::queue::Queue;
use crate::utils::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the message is retried per the queue's policy.
    #[error("{0}")]
    Retry(String),
    /// Permanent failure; the message is dead-lettered without more attempts.
    #[error("{0}")]
    Reject(String),
}

impl HandlerError {
    pub fn retry(reason: impl Into<String>) -> Self {
        HandlerError::Retry(reason.into())
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        HandlerError::Reject(reason.into())
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Processes one message at a time.
///
/// Any `Fn(Message) -> impl Future<Output = HandlerResult>` closure is a
/// handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self)(message).await
    }
}

#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct ConsumerGroup {
    id: String,
    queue: Arc<Queue>,
    stop_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerGroup {
    /// Spawns `options.concurrency` workers (at least one) on the current
    /// tokio runtime.
    pub fn start(
        id: impl Into<String>,
        queue: Arc<Queue>,
        handler: Arc<dyn Handler>,
        idempotency: Arc<IdempotencyRegistry>,
        options: GroupOptions,
    ) -> Self {
        let id = id.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let concurrency = options.concurrency.max(1);

        let workers = (0..concurrency)
            .map(|n| {
                let worker = Worker {
                    consumer_id: format!("{id}-{n}"),
                    queue: Arc::clone(&queue),
                    handler: Arc::clone(&handler),
                    idempotency: Arc::clone(&idempotency),
                    poll_interval: options.poll_interval,
                };
                tokio::spawn(worker.run(stop_rx.clone()))
            })
            .collect();

        info!(group = %id, queue = %queue.name(), concurrency, "consumer group started");
        Self {
            id,
            queue,
            stop_tx,
            workers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }

    /// Asks every worker to stop once its current message is settled and
    /// waits for them. Leases held by a handler that never returns are
    /// recovered by the visibility timeout, not here.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(group = %self.id, error = %e, "consumer worker ended abnormally");
            }
        }
        info!(group = %self.id, "consumer group stopped");
    }
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("id", &self.id)
            .field("queue", &self.queue.name())
            .field("concurrency", &self.workers.len())
            .finish()
    }
}

struct Worker {
    consumer_id: String,
    queue: Arc<Queue>,
    handler: Arc<dyn Handler>,
    idempotency: Arc<IdempotencyRegistry>,
    poll_interval: Duration,
}

impl Worker {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        debug!(consumer = %self.consumer_id, "worker started");
        loop {
            if *stop.borrow() {
                break;
            }
            match self.queue.lease(&self.consumer_id) {
                Some(message) => self.process(message).await,
                None => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        changed = stop.changed() => {
                            // Sender gone means the group was dropped.
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!(consumer = %self.consumer_id, "worker exited");
    }

    async fn process(&self, message: Message) {
        let scope = self.queue.name();

        if self.idempotency.is_processed(scope, &message.id) {
            debug!(
                consumer = %self.consumer_id,
                message_id = %message.id,
                "already processed, acking without handler"
            );
            self.queue.record_duplicate();
            self.settle(&message, self.queue.ack(&message.id));
            return;
        }

        let outcome = AssertUnwindSafe(self.handler.handle(message.clone()))
            .catch_unwind()
            .await;

        let settled = match outcome {
            Ok(Ok(())) => {
                self.idempotency.mark_processed(scope, &message.id);
                self.queue.ack(&message.id)
            }
            Ok(Err(HandlerError::Retry(reason))) => self.queue.nack(&message.id, &reason),
            Ok(Err(HandlerError::Reject(reason))) => self.queue.reject(&message.id, &reason),
            Err(panic) => {
                let reason = format!("handler panicked: {}", panic_message(panic.as_ref()));
                warn!(consumer = %self.consumer_id, message_id = %message.id, %reason);
                self.queue.nack(&message.id, &reason)
            }
        };
        self.settle(&message, settled);
    }

    fn settle(&self, message: &Message, result: Result<()>) {
        if let Err(e) = result {
            warn!(
                consumer = %self.consumer_id,
                message_id = %message.id,
                error = %e,
                "settlement ignored"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
