//! Worker pool: a fixed set of persistent workers draining a shared FIFO.
//!
//! Each worker waits on the work gate, takes one envelope, dispatches it to
//! its handler, acks on success, and reports ready to the poller. A message
//! that cannot be dispatched is simply not acked; the queue redelivers it
//! once its visibility timeout lapses.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::gate::Gate;
use crate::message::Envelope;
use crate::queue::QueueClient;
use crate::registry::{HandlerRegistry, within_scope};
use crate::telemetry::dispatch::{
    AbandonReason, record_message_type, record_outcome, start_message_span,
};
use crate::telemetry::metrics;

/// A worker has capacity for more work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub worker_id: usize,
}

/// Where the poller sends received batches.
#[async_trait]
pub trait WorkSink: Send + Sync {
    /// Enqueue messages for the workers. Never blocks.
    fn add_work(&self, messages: Vec<Envelope>);

    /// Ask every worker to stop once its current message is done.
    fn finish_work(&self);

    /// Wait up to `grace` for all workers to stop. Returns whether they did.
    async fn wait_for_drain(&self, grace: Duration) -> bool;
}

struct Shared {
    config: Arc<DispatcherConfig>,
    queue: Arc<dyn QueueClient>,
    registry: Arc<HandlerRegistry>,
    pending: SegQueue<Envelope>,
    work_gate: Gate,
    cancel: CancellationToken,
    live: AtomicUsize,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    /// Start `config.concurrency_level` workers.
    ///
    /// Returns the pool and the receiving end of its ready channel, which
    /// belongs to the poller. Must be called from within a Tokio runtime.
    pub fn start(
        config: Arc<DispatcherConfig>,
        queue: Arc<dyn QueueClient>,
        registry: Arc<HandlerRegistry>,
    ) -> (Self, mpsc::Receiver<Ready>) {
        let concurrency = config.concurrency_level.max(1);
        let (ready_tx, ready_rx) = mpsc::channel(concurrency);

        let shared = Arc::new(Shared {
            config,
            queue,
            registry,
            pending: SegQueue::new(),
            work_gate: Gate::new(),
            cancel: CancellationToken::new(),
            live: AtomicUsize::new(concurrency),
        });

        // Workers hold the only senders: the channel closes once they have all exited.
        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let shared = Arc::clone(&shared);
            let ready_tx = ready_tx.clone();
            workers.spawn(async move {
                shared.run_worker(worker_id, ready_tx).await;
                shared.live.fetch_sub(1, Ordering::SeqCst);
            });
        }

        let pool = Self {
            shared,
            workers: Mutex::new(workers),
        };
        (pool, ready_rx)
    }

    pub fn concurrency(&self) -> usize {
        self.shared.config.concurrency_level.max(1)
    }

    /// Workers whose loop has not yet exited.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Messages waiting in the FIFO.
    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }
}

#[async_trait]
impl WorkSink for WorkerPool {
    fn add_work(&self, messages: Vec<Envelope>) {
        if messages.is_empty() {
            return;
        }
        metrics::messages_received().add(
            messages.len() as u64,
            &[metrics::destination(&self.shared.config.queue_name)],
        );
        for envelope in messages {
            self.shared.pending.push(envelope);
            self.shared.work_gate.signal();
        }
    }

    fn finish_work(&self) {
        info!(pending = self.pending(), "stopping workers");
        self.shared.cancel.cancel();
        for _ in 0..self.concurrency() {
            self.shared.work_gate.signal();
        }
    }

    async fn wait_for_drain(&self, grace: Duration) -> bool {
        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "worker task ended abnormally");
                }
            }
        })
        .await;
        drained.is_ok()
    }
}

impl Shared {
    async fn run_worker(&self, worker_id: usize, ready_tx: mpsc::Sender<Ready>) {
        info!(worker_id, "worker starting");
        notify_ready(&ready_tx, worker_id);

        loop {
            // Skip the wait while a backlog remains; the gate holds one wake at most.
            if self.pending.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = self.work_gate.wait() => {}
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(envelope) = self.pending.pop() else {
                notify_ready(&ready_tx, worker_id);
                continue;
            };
            if !self.pending.is_empty() {
                self.work_gate.signal();
            }

            let _ = self.process(worker_id, envelope).await;
            notify_ready(&ready_tx, worker_id);
        }

        info!(worker_id, "worker exiting");
    }

    async fn process(&self, worker_id: usize, envelope: Envelope) -> Result<(), AbandonReason> {
        let queue_name = self.config.queue_name.as_str();
        let span = start_message_span(queue_name, &envelope.id, worker_id);

        let outcome = self
            .dispatch(&envelope, &span)
            .instrument(span.clone())
            .await;

        record_outcome(&span, outcome);
        let label = match outcome {
            Ok(()) => "acked",
            Err(reason) => reason.as_str(),
        };
        metrics::messages_dispatched().add(
            1,
            &[
                metrics::destination(queue_name),
                KeyValue::new("outcome", label),
            ],
        );
        outcome
    }

    async fn dispatch(&self, envelope: &Envelope, span: &Span) -> Result<(), AbandonReason> {
        let Some(message_type) = envelope.message_type() else {
            warn!(message_id = %envelope.id, "message has no type attribute, skipping");
            return Err(AbandonReason::MissingType);
        };
        record_message_type(span, message_type);

        let default_visibility = self.config.default_visibility_timeout_seconds;
        if let Some(seconds) = envelope.visibility_override(default_visibility) {
            info!(message_id = %envelope.id, seconds, "extending visibility timeout");
            // A taken message runs to completion, so its extension ignores shutdown too.
            if let Err(e) = self
                .queue
                .extend_visibility(&envelope.receipt_handle, seconds, &CancellationToken::new())
                .await
            {
                warn!(
                    message_id = %envelope.id,
                    error = %e,
                    "visibility extension failed, current timeout stays in effect"
                );
            }
        }

        if !within_scope(message_type, self.config.handler_scope.as_deref()) {
            warn!(
                message_id = %envelope.id,
                message_type,
                scope = ?self.config.handler_scope,
                "message type outside handler scope, skipping"
            );
            return Err(AbandonReason::OutOfScope);
        }

        let Some(resolved) = self.registry.resolve_type(message_type) else {
            error!(message_id = %envelope.id, message_type, "unknown message type, skipping");
            return Err(AbandonReason::UnknownType);
        };

        let decoded = match resolved.decode(&envelope.body) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(message_id = %envelope.id, message_type, error = %e, "cannot decode body, skipping");
                return Err(AbandonReason::Undecodable);
            }
        };

        let Some(handler) = self.registry.resolve(message_type) else {
            error!(
                message_id = %envelope.id,
                message_type,
                "no registered handler for message type, skipping"
            );
            return Err(AbandonReason::NoHandler);
        };

        // Run on its own task so a panicking handler only fails this message.
        let started = Instant::now();
        let cancel = self.cancel.clone();
        let result = tokio::spawn(
            async move { handler.handle_dyn(decoded, cancel).await }.instrument(Span::current()),
        )
        .await;
        metrics::handler_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("message.type", message_type.to_string())],
        );

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    message_id = %envelope.id,
                    message_type,
                    error = %e,
                    "handler failed, message will be retried"
                );
                return Err(AbandonReason::HandlerFailed);
            }
            Err(e) => {
                error!(
                    message_id = %envelope.id,
                    message_type,
                    error = %e,
                    "handler panicked, message will be retried"
                );
                return Err(AbandonReason::HandlerFailed);
            }
        }

        // Acks are not tied to shutdown: a handled message should not come back.
        match self
            .queue
            .delete(&envelope.receipt_handle, &CancellationToken::new())
            .await
        {
            Ok(()) => {
                info!(message_id = %envelope.id, message_type, "deleted message");
                Ok(())
            }
            Err(e) => {
                error!(
                    message_id = %envelope.id,
                    error = %e,
                    "ack failed, message will be redelivered"
                );
                Err(AbandonReason::AckFailed)
            }
        }
    }
}

fn notify_ready(ready_tx: &mpsc::Sender<Ready>, worker_id: usize) {
    // A full channel already tells the poller someone is free.
    let _ = ready_tx.try_send(Ready { worker_id });
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shared.cancel.is_cancelled() {
            debug!("worker pool dropped without finish_work");
            self.shared.cancel.cancel();
        }
    }
}
