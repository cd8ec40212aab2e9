//! Poller: the single ingestion loop.
//!
//! Waits (bounded) for a worker to report capacity, long-polls the queue,
//! and hands each batch to the worker pool. After an empty batch capacity
//! is still known to be free, so the next poll starts at once. Transient
//! receive failures are logged and retried; a fatal one stops ingestion.
//! On exit the pool is told to finish and given a grace period to drain.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::message::{MESSAGE_TYPE_ATTRIBUTE, VISIBILITY_TIMEOUT_ATTRIBUTE};
use crate::pool::{Ready, WorkSink};
use crate::queue::{QueueClient, ReceiveRequest};

/// How the ingestion loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// The cancellation token fired.
    Cancelled,
    /// The transport reported an error retrying cannot fix.
    Fatal,
    /// Every worker dropped its side of the ready channel.
    WorkersGone,
}

pub struct Poller {
    config: Arc<DispatcherConfig>,
    queue: Arc<dyn QueueClient>,
    sink: Arc<dyn WorkSink>,
    ready: mpsc::Receiver<Ready>,
}

impl Poller {
    pub fn new(
        config: Arc<DispatcherConfig>,
        queue: Arc<dyn QueueClient>,
        sink: Arc<dyn WorkSink>,
        ready: mpsc::Receiver<Ready>,
    ) -> Self {
        Self {
            config,
            queue,
            sink,
            ready,
        }
    }

    fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            wait_seconds: self.config.poll_wait_seconds,
            max_messages: self.config.receive_batch_size(),
            visibility_timeout_seconds: self.config.default_visibility_timeout_seconds,
            attribute_names: vec![
                MESSAGE_TYPE_ATTRIBUTE.to_string(),
                VISIBILITY_TIMEOUT_ATTRIBUTE.to_string(),
            ],
        }
    }

    /// Run until cancelled or a fatal transport error, then stop the pool.
    pub async fn execute(mut self, cancel: CancellationToken) -> PollerExit {
        let queue_name = self.queue.queue_name().to_string();
        let request = self.receive_request();
        info!(
            queue = %queue_name,
            max_messages = request.max_messages,
            wait_seconds = request.wait_seconds,
            "poller started"
        );

        // An empty batch dispatched nothing, so whoever was free still is.
        let mut capacity_free = false;

        let exit = loop {
            if cancel.is_cancelled() {
                break PollerExit::Cancelled;
            }

            if capacity_free {
                tokio::task::yield_now().await;
                if self.drain_ready() {
                    break PollerExit::WorkersGone;
                }
            } else {
                // Wait for capacity, but never forever: a lost token must not stall ingestion.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break PollerExit::Cancelled,
                    ready = tokio::time::timeout(self.config.ready_wait(), self.ready.recv()) => {
                        match ready {
                            Ok(Some(Ready { worker_id })) => {
                                debug!(worker_id, "worker ready");
                                if self.drain_ready() {
                                    break PollerExit::WorkersGone;
                                }
                            }
                            Ok(None) => break PollerExit::WorkersGone,
                            Err(_) => debug!("no worker reported ready in time, polling anyway"),
                        }
                    }
                }
            }

            match self.queue.receive_batch(&request, &cancel).await {
                Ok(messages) => {
                    capacity_free = messages.is_empty();
                    if !capacity_free {
                        debug!(queue = %queue_name, count = messages.len(), "received messages");
                    }
                    self.sink.add_work(messages);
                }
                Err(e) if e.is_fatal() => {
                    error!(queue = %queue_name, error = %e, "fatal receive error, stopping ingestion");
                    break PollerExit::Fatal;
                }
                Err(e) => {
                    // The ready wait doubles as the retry backoff.
                    capacity_free = false;
                    error!(queue = %queue_name, error = %e, "receive failed, will retry");
                }
            }
        };

        match exit {
            PollerExit::Cancelled => info!(queue = %queue_name, "poller cancelled"),
            PollerExit::Fatal => {}
            PollerExit::WorkersGone => warn!(queue = %queue_name, "no workers left, stopping"),
        }

        self.sink.finish_work();
        let grace = self.config.drain_grace();
        if self.sink.wait_for_drain(grace).await {
            info!(queue = %queue_name, "workers drained");
        } else {
            warn!(
                queue = %queue_name,
                grace_ms = grace.as_millis() as u64,
                "workers still busy after drain grace period"
            );
        }
        info!(queue = %queue_name, "poller exiting");
        exit
    }

    /// Collapse queued ready tokens into the poll about to happen.
    /// Returns true if the channel has closed.
    fn drain_ready(&mut self) -> bool {
        loop {
            match self.ready.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }
}
