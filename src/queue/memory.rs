//! In-process queue with visibility-timeout semantics.
//!
//! Behaves like a hosted queue as far as the dispatcher can tell: received
//! messages are hidden for the visibility timeout, every receive issues a
//! fresh receipt handle, and only the latest handle can delete or extend.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{QueueClient, ReceiveRequest, retain_requested};
use crate::error::{Error, Result};
use crate::message::{AttributeValue, Envelope, OutgoingMessage, ReceiptHandle};

struct StoredMessage {
    id: String,
    body: String,
    attributes: HashMap<String, AttributeValue>,
    sent_at: chrono::DateTime<Utc>,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<ReceiptHandle>,
}

impl StoredMessage {
    fn to_envelope(&self, receipt: ReceiptHandle) -> Envelope {
        Envelope {
            id: self.id.clone(),
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            receipt_handle: receipt,
            receive_count: self.receive_count,
            sent_at: Some(self.sent_at),
        }
    }
}

/// In-memory queue. Cheap to construct; share it behind an `Arc`.
pub struct InMemoryQueue {
    name: String,
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Messages not yet deleted, whether visible or in flight.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }

    /// Messages currently available to a receive.
    pub async fn visible_len(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| m.visible_at <= now)
            .count()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn receive_batch(
        &self,
        request: &ReceiveRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>> {
        let deadline = Instant::now() + Duration::from_secs(request.wait_seconds.into());
        let visibility = Duration::from_secs(request.visibility_timeout_seconds.into());
        let max = request.max_messages.max(1) as usize;

        loop {
            let mut messages = self.messages.lock().await;
            let now = Instant::now();

            let mut batch = Vec::new();
            for stored in messages.iter_mut().filter(|m| m.visible_at <= now).take(max) {
                let receipt = ReceiptHandle(Uuid::new_v4().to_string());
                stored.visible_at = now + visibility;
                stored.receive_count += 1;
                stored.receipt = Some(receipt.clone());
                let mut envelope = stored.to_envelope(receipt);
                retain_requested(&mut envelope, &request.attribute_names);
                batch.push(envelope);
            }

            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            // Wake on a send, on the next in-flight message reappearing, or at the deadline.
            let wake_at = messages
                .iter()
                .map(|m| m.visible_at)
                .min()
                .map_or(deadline, |t| t.min(deadline));
            let notified = self.notify.notified();
            drop(messages);

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = cancel.cancelled() => return Ok(Vec::new()),
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle, _cancel: &CancellationToken) -> Result<()> {
        let mut messages = self.messages.lock().await;
        let Some(index) = messages
            .iter()
            .position(|m| m.receipt.as_ref() == Some(receipt))
        else {
            return Err(Error::transient(
                "delete",
                format!("unknown or stale receipt handle {receipt}"),
            ));
        };
        messages.remove(index);
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        seconds: u32,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let mut messages = self.messages.lock().await;
        let stored = messages
            .iter_mut()
            .find(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| {
                Error::transient(
                    "extend_visibility",
                    format!("unknown or stale receipt handle {receipt}"),
                )
            })?;
        stored.visible_at = Instant::now() + Duration::from_secs(seconds.into());
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let mut messages = self.messages.lock().await;
        messages.push_back(StoredMessage {
            id: id.clone(),
            body: message.body,
            attributes: message.attributes,
            sent_at: Utc::now(),
            visible_at: Instant::now() + Duration::from_secs(message.delay_seconds.into()),
            receive_count: 0,
            receipt: None,
        });
        drop(messages);
        self.notify.notify_waiters();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MESSAGE_TYPE_ATTRIBUTE;
    use std::sync::Arc;

    fn request(wait_seconds: u32, visibility: u32) -> ReceiveRequest {
        ReceiveRequest {
            wait_seconds,
            max_messages: 10,
            visibility_timeout_seconds: visibility,
            attribute_names: Vec::new(),
        }
    }

    #[tokio::test]
    async fn received_message_is_hidden_until_deleted() {
        let queue = InMemoryQueue::new("test");
        let cancel = CancellationToken::new();
        queue.send(OutgoingMessage::new("hello")).await.unwrap();

        let batch = queue.receive_batch(&request(0, 30), &cancel).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].receive_count, 1);

        let again = queue.receive_batch(&request(0, 30), &cancel).await.unwrap();
        assert!(again.is_empty());

        queue.delete(&batch[0].receipt_handle, &cancel).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_after_visibility_timeout() {
        let queue = InMemoryQueue::new("test");
        let cancel = CancellationToken::new();
        queue.send(OutgoingMessage::new("retry me")).await.unwrap();

        let first = queue.receive_batch(&request(0, 0), &cancel).await.unwrap();
        let second = queue.receive_batch(&request(1, 0), &cancel).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].receive_count, 2);

        // The first receipt is stale now.
        let stale = queue.delete(&first[0].receipt_handle, &cancel).await;
        assert!(stale.is_err());
        queue.delete(&second[0].receipt_handle, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn extend_visibility_keeps_message_hidden() {
        let queue = InMemoryQueue::new("test");
        let cancel = CancellationToken::new();
        queue.send(OutgoingMessage::new("slow")).await.unwrap();

        let batch = queue.receive_batch(&request(0, 0), &cancel).await.unwrap();
        queue
            .extend_visibility(&batch[0].receipt_handle, 60, &cancel)
            .await
            .unwrap();
        assert_eq!(queue.visible_len().await, 0);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn delayed_message_stays_invisible_until_the_delay_passes() {
        let queue = InMemoryQueue::new("test");
        let cancel = CancellationToken::new();
        queue.send(OutgoingMessage::new("later").delay(1)).await.unwrap();

        let early = queue.receive_batch(&request(0, 30), &cancel).await.unwrap();
        assert!(early.is_empty());
        assert_eq!(queue.visible_len().await, 0);

        let batch = queue.receive_batch(&request(3, 30), &cancel).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "later");
    }

    #[tokio::test]
    async fn long_poll_wakes_on_send() {
        let queue = Arc::new(InMemoryQueue::new("test"));
        let cancel = CancellationToken::new();

        let receiver = tokio::spawn({
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            async move { queue.receive_batch(&request(5, 30), &cancel).await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.send(OutgoingMessage::new("late")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .expect("long poll should wake on send")
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_long_poll_returns_empty() {
        let queue = InMemoryQueue::new("test");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let batch = queue.receive_batch(&request(20, 30), &cancel).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn receive_returns_only_requested_attributes() {
        let queue = InMemoryQueue::new("test");
        let cancel = CancellationToken::new();
        queue
            .send(
                OutgoingMessage::new("{}")
                    .message_type("a.b")
                    .attribute("Unrequested", AttributeValue::string("x")),
            )
            .await
            .unwrap();

        let mut req = request(0, 30);
        req.attribute_names = vec![MESSAGE_TYPE_ATTRIBUTE.to_string()];
        let batch = queue.receive_batch(&req, &cancel).await.unwrap();
        assert_eq!(batch[0].attributes.len(), 1);
        assert_eq!(batch[0].message_type(), Some("a.b"));
    }
}
