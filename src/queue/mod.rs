//! Queue client port and its transports.
//!
//! The dispatcher only talks to the backing queue through [`QueueClient`].
//! `pgmq` is the production transport; `memory` backs tests and local runs.

pub mod memory;
pub mod pgmq;

pub use memory::InMemoryQueue;
pub use pgmq::PgmqQueue;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::{Envelope, OutgoingMessage, ReceiptHandle};

/// Parameters for a batch receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Long-poll bound in seconds; 0 returns immediately.
    pub wait_seconds: u32,
    pub max_messages: u32,
    /// How long received messages stay hidden from other receivers.
    pub visibility_timeout_seconds: u32,
    /// Attributes the caller needs populated on each envelope.
    pub attribute_names: Vec<String>,
}

/// Operations the dispatcher needs from a backing queue.
///
/// Implementations return [`Error::Transport`](crate::error::Error::Transport)
/// with `fatal: true` only for failures that retrying cannot fix.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Name of the queue this client reads from.
    fn queue_name(&self) -> &str;

    /// Receive up to `max_messages`, waiting at most `wait_seconds`.
    /// Zero messages is a valid result.
    async fn receive_batch(
        &self,
        request: &ReceiveRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>>;

    /// Acknowledge a message so it is never redelivered.
    async fn delete(&self, receipt: &ReceiptHandle, cancel: &CancellationToken) -> Result<()>;

    /// Hide a received message for `seconds` from now.
    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        seconds: u32,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Send a message; returns its queue-assigned id.
    async fn send(&self, message: OutgoingMessage) -> Result<String>;
}

/// Filter envelope attributes down to the requested names.
///
/// Mirrors hosted queues that only return attributes the receive call asked
/// for. An empty request keeps everything.
pub(crate) fn retain_requested(envelope: &mut Envelope, names: &[String]) {
    if names.is_empty() {
        return;
    }
    envelope.attributes.retain(|k, _| names.iter().any(|n| n == k));
}
