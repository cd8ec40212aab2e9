//! Shared test doubles: a scripted, recording queue client and a counting handler.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use dispatchq::error::{Error, Result};
use dispatchq::message::{
    AttributeValue, Envelope, MESSAGE_TYPE_ATTRIBUTE, OutgoingMessage, ReceiptHandle,
    VISIBILITY_TIMEOUT_ATTRIBUTE,
};
use dispatchq::queue::{QueueClient, ReceiveRequest};
use dispatchq::registry::{Handler, HandlerError, Message};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// One observed interaction, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Receive,
    Extend { receipt: String, seconds: u32 },
    Handled { message_id: String },
    Delete { receipt: String },
    Send,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// Queue client that replays scripted receive results and records every call.
///
/// Once the script runs out, receives behave like an empty long poll: they
/// return nothing after a short wait, or at once if cancelled.
pub struct RecordingQueue {
    name: String,
    script: Mutex<VecDeque<Result<Vec<Envelope>>>>,
    log: CallLog,
    fail_deletes: AtomicBool,
    fail_extends: AtomicBool,
    hold_extends: AtomicBool,
    extend_started: Notify,
    extend_release: Notify,
    extend_cancelled: Mutex<Vec<bool>>,
    last_request: Mutex<Option<ReceiveRequest>>,
}

impl RecordingQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            log: Arc::new(Mutex::new(Vec::new())),
            fail_deletes: AtomicBool::new(false),
            fail_extends: AtomicBool::new(false),
            hold_extends: AtomicBool::new(false),
            extend_started: Notify::new(),
            extend_release: Notify::new(),
            extend_cancelled: Mutex::new(Vec::new()),
            last_request: Mutex::new(None),
        }
    }

    pub fn push_batch(&self, batch: Vec<Envelope>) {
        self.script.lock().unwrap().push_back(Ok(batch));
    }

    pub fn push_error(&self, error: Error) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn fail_extends(&self) {
        self.fail_extends.store(true, Ordering::SeqCst);
    }

    /// Make each extension wait for [`release_extend`](Self::release_extend).
    pub fn hold_extends(&self) {
        self.hold_extends.store(true, Ordering::SeqCst);
    }

    /// Resolves once a held extension is waiting.
    pub async fn extend_started(&self) {
        self.extend_started.notified().await;
    }

    pub fn release_extend(&self) {
        self.extend_release.notify_one();
    }

    /// Whether each finished extension saw its cancellation token fired.
    pub fn extend_cancellations(&self) -> Vec<bool> {
        self.extend_cancelled.lock().unwrap().clone()
    }

    pub fn log(&self) -> CallLog {
        Arc::clone(&self.log)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn receives(&self) -> usize {
        self.count(|c| matches!(c, Call::Receive))
    }

    pub fn deletes(&self) -> usize {
        self.count(|c| matches!(c, Call::Delete { .. }))
    }

    pub fn extends(&self) -> Vec<u32> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Extend { seconds, .. } => Some(*seconds),
                _ => None,
            })
            .collect()
    }

    pub fn handled(&self) -> usize {
        self.count(|c| matches!(c, Call::Handled { .. }))
    }

    pub fn last_request(&self) -> Option<ReceiveRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl QueueClient for RecordingQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn receive_batch(
        &self,
        request: &ReceiveRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>> {
        self.record(Call::Receive);
        *self.last_request.lock().unwrap() = Some(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
                Ok(Vec::new())
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle, _cancel: &CancellationToken) -> Result<()> {
        self.record(Call::Delete {
            receipt: receipt.0.clone(),
        });
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::transient("delete", "receipt expired"));
        }
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        seconds: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.record(Call::Extend {
            receipt: receipt.0.clone(),
            seconds,
        });
        if self.hold_extends.load(Ordering::SeqCst) {
            self.extend_started.notify_one();
            self.extend_release.notified().await;
        }
        self.extend_cancelled
            .lock()
            .unwrap()
            .push(cancel.is_cancelled());
        if self.fail_extends.load(Ordering::SeqCst) {
            return Err(Error::transient("extend", "receipt expired"));
        }
        Ok(())
    }

    async fn send(&self, _message: OutgoingMessage) -> Result<String> {
        self.record(Call::Send);
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

// ---------------------------------------------------------------------------
// Messages and handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMessage {
    pub id: String,
    #[serde(default)]
    pub fail: bool,
}

impl Message for TestMessage {
    const TYPE: &'static str = "TestMessage";
}

/// Records each call in the shared log; fails when the message asks it to.
pub struct RecordingHandler {
    pub log: CallLog,
}

#[async_trait]
impl Handler<TestMessage> for RecordingHandler {
    async fn handle(
        &self,
        message: TestMessage,
        _cancel: CancellationToken,
    ) -> std::result::Result<(), HandlerError> {
        self.log.lock().unwrap().push(Call::Handled {
            message_id: message.id.clone(),
        });
        if message.fail {
            return Err(format!("handler rejected {}", message.id).into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn envelope(id: &str, message_type: Option<&str>, body: &str) -> Envelope {
    let mut attributes = HashMap::new();
    if let Some(message_type) = message_type {
        attributes.insert(
            MESSAGE_TYPE_ATTRIBUTE.to_string(),
            AttributeValue::string(message_type),
        );
    }
    Envelope {
        id: id.to_string(),
        body: body.to_string(),
        attributes,
        receipt_handle: ReceiptHandle(format!("receipt-{id}")),
        receive_count: 1,
        sent_at: None,
    }
}

pub fn test_envelope(id: &str) -> Envelope {
    envelope(id, Some(TestMessage::TYPE), &format!(r#"{{"id":"{id}"}}"#))
}

pub fn with_visibility(mut envelope: Envelope, value: &str) -> Envelope {
    envelope.attributes.insert(
        VISIBILITY_TIMEOUT_ATTRIBUTE.to_string(),
        AttributeValue::string(value),
    );
    envelope
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
