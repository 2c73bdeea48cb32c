use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use event_store::EventEnvelope;
use futures_util::FutureExt;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    BusConfig, BusError, EventHandler, HandlerError, HandlerFailure, Result, SubscriptionTable,
};

struct Queued {
    seq: u64,
    event: EventEnvelope,
}

/// Sequence bookkeeping for `wait`.
#[derive(Default)]
struct Progress {
    next_seq: u64,
    pending: BTreeSet<u64>,
}

/// State shared between the bus handle and its workers.
struct Shared {
    subscriptions: Arc<SubscriptionTable>,
    progress: Mutex<Progress>,
    drained: Notify,
    errors: mpsc::UnboundedSender<HandlerFailure>,
}

impl Shared {
    async fn reserve(&self) -> u64 {
        let mut progress = self.progress.lock().await;
        let seq = progress.next_seq;
        progress.next_seq += 1;
        progress.pending.insert(seq);
        seq
    }

    async fn complete(&self, seq: u64) {
        self.progress.lock().await.pending.remove(&seq);
        self.drained.notify_waiters();
    }

    /// Runs every subscribed handler. Failures, panics included, are
    /// reported on the error channel and never stop later handlers.
    async fn dispatch(&self, event: &EventEnvelope) {
        for handler in self.subscriptions.handlers_for(&event.event_type).await {
            metrics::counter!("event_bus_handler_invocations_total").increment(1);
            let outcome = AssertUnwindSafe(handler.handle(event))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panicked(panic)));
            if let Err(error) = outcome {
                metrics::counter!("event_bus_handler_failures_total").increment(1);
                tracing::warn!(handler = handler.name(), error = %error, "Handler failed");
                // The receiver lives as long as the bus handle.
                let _ = self.errors.send(HandlerFailure::new(handler.name(), event, error));
            }
        }
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> HandlerError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    HandlerError::new(format!("handler panicked: {message}"))
}

/// Queued, worker-pool event bus.
///
/// `publish` enqueues and returns; a fixed pool of workers drains the bounded
/// queue. When the queue is full, `publish` waits for space. Handler failures
/// go to an error channel read with [`drain_errors`](Self::drain_errors).
///
/// With more than one worker, two events may be handled concurrently and in
/// either order. Use a single worker when subscribers need per-aggregate
/// ordering.
pub struct AsyncEventBus {
    shared: Arc<Shared>,
    intake: RwLock<Option<mpsc::Sender<Queued>>>,
    errors: Mutex<mpsc::UnboundedReceiver<HandlerFailure>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    config: BusConfig,
}

impl AsyncEventBus {
    /// Starts the worker pool. Must be called inside a tokio runtime.
    pub fn new(config: BusConfig) -> Self {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// Starts the worker pool under an externally owned cancellation token.
    ///
    /// Cancelling the token makes workers stop taking new events. Events
    /// still queued at that point are dropped.
    pub fn with_cancellation(config: BusConfig, cancel: CancellationToken) -> Self {
        let (intake, receiver) = mpsc::channel(config.queue_capacity);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            subscriptions: Arc::new(SubscriptionTable::new()),
            progress: Mutex::new(Progress::default()),
            drained: Notify::new(),
            errors: errors_tx,
        });

        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..config.workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&shared),
                    Arc::clone(&receiver),
                    cancel.clone(),
                ))
            })
            .collect();

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Async event bus started"
        );

        Self {
            shared,
            intake: RwLock::new(Some(intake)),
            errors: Mutex::new(errors_rx),
            workers: Mutex::new(workers),
            cancel,
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub async fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.shared.subscriptions.subscribe(event_type, handler).await;
    }

    pub async fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        self.shared.subscriptions.subscribe_all(handler).await;
    }

    /// Enqueues an event for dispatch.
    ///
    /// Fails with `Stopped` after [`stop`](Self::stop).
    pub async fn publish(&self, event: EventEnvelope) -> Result<()> {
        self.enqueue(event, None).await
    }

    /// Enqueues an event, giving up with `Cancelled` if `cancel` fires while
    /// waiting for queue space.
    pub async fn publish_with_cancel(
        &self,
        event: EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.enqueue(event, Some(cancel)).await
    }

    /// Enqueues events in order.
    pub async fn publish_batch(
        &self,
        events: impl IntoIterator<Item = EventEnvelope>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        for event in events {
            self.enqueue(event, cancel).await?;
        }
        Ok(())
    }

    async fn enqueue(&self, event: EventEnvelope, cancel: Option<&CancellationToken>) -> Result<()> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(BusError::Cancelled);
        }
        let sender = self.intake.read().await.clone().ok_or(BusError::Stopped)?;

        let seq = self.shared.reserve().await;
        let queued = Queued { seq, event };

        let sent = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(BusError::Cancelled),
                result = sender.send(queued) => result.map_err(|_| BusError::Stopped),
            },
            None => sender.send(queued).await.map_err(|_| BusError::Stopped),
        };

        match sent {
            Ok(()) => {
                metrics::counter!("event_bus_events_published_total", "mode" => "async")
                    .increment(1);
                Ok(())
            }
            Err(err) => {
                self.shared.complete(seq).await;
                Err(err)
            }
        }
    }

    /// Number of accepted events not yet fully dispatched.
    pub async fn pending(&self) -> usize {
        self.shared.progress.lock().await.pending.len()
    }

    /// Waits until every event accepted before this call has been dispatched
    /// to all of its handlers.
    ///
    /// Returns `Cancelled` if the bus is cancelled first, since queued events
    /// will then never be dispatched.
    pub async fn wait(&self) -> Result<()> {
        let target = self.shared.progress.lock().await.next_seq;
        loop {
            let notified = self.shared.drained.notified();
            {
                let progress = self.shared.progress.lock().await;
                if progress.pending.range(..target).next().is_none() {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return Err(BusError::Cancelled),
            }
        }
    }

    /// Takes every handler failure reported so far.
    pub async fn drain_errors(&self) -> Vec<HandlerFailure> {
        let mut receiver = self.errors.lock().await;
        let mut failures = Vec::new();
        while let Ok(failure) = receiver.try_recv() {
            failures.push(failure);
        }
        failures
    }

    /// Stops accepting events. Already queued events are still dispatched.
    pub async fn stop(&self) {
        if self.intake.write().await.take().is_some() {
            tracing::info!("Async event bus stopped accepting events");
        }
    }

    pub async fn is_stopped(&self) -> bool {
        self.intake.read().await.is_none()
    }

    /// Stops intake, drains the queue and joins the workers.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await;
        self.wait().await?;

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Event bus worker panicked");
            }
        }
        tracing::info!("Async event bus shut down");
        Ok(())
    }

    /// Cancels the workers without draining.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    worker: usize,
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::Receiver<Queued>>>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker, "Event bus worker started");
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = receiver.recv() => item,
            }
        };

        let Some(Queued { seq, event }) = next else {
            break;
        };

        let span = tracing::debug_span!(
            "event_bus.dispatch",
            worker,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            version = %event.version,
        );
        shared.dispatch(&event).instrument(span).await;
        shared.complete(seq).await;
    }
    tracing::debug!(worker, "Event bus worker exited");
}
