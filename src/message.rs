//! Message envelope: what the queue hands us and what we hand back to ack.
//!
//! An envelope is owned by exactly one component at a time: the poller
//! after a receive, the pool's FIFO after `add_work`, then a single worker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribute carrying the type discriminator used to select a handler.
pub const MESSAGE_TYPE_ATTRIBUTE: &str = "MessageType";

/// Optional numeric attribute requesting a visibility extension before handling.
pub const VISIBILITY_TIMEOUT_ATTRIBUTE: &str = "VisibilityTimeout";

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Declared type of an attribute value. Values always travel as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub data_type: AttributeType,
    pub string_value: String,
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: AttributeType::String,
            string_value: value.into(),
        }
    }

    pub fn number(value: impl ToString) -> Self {
        Self {
            data_type: AttributeType::Number,
            string_value: value.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Opaque token identifying one particular receipt of a message.
///
/// Deletes and visibility changes must present the handle from the most
/// recent receive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(pub String);

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as received from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub body: String,
    pub attributes: HashMap<String, AttributeValue>,
    pub receipt_handle: ReceiptHandle,
    /// How many times the queue has handed this message out, this receipt included.
    pub receive_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|v| v.string_value.as_str())
    }

    /// The type discriminator, if present and non-blank.
    pub fn message_type(&self) -> Option<&str> {
        self.attribute(MESSAGE_TYPE_ATTRIBUTE)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Requested visibility extension in seconds.
    ///
    /// `None` when the attribute is absent. An unparsable or negative value
    /// falls back to `default_seconds`.
    pub fn visibility_override(&self, default_seconds: u32) -> Option<u32> {
        self.attribute(VISIBILITY_TIMEOUT_ATTRIBUTE)
            .map(|raw| raw.trim().parse::<u32>().unwrap_or(default_seconds))
    }
}

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

/// A message to be sent to the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub body: String,
    pub attributes: HashMap<String, AttributeValue>,
    /// Seconds before the message first becomes visible.
    pub delay_seconds: u32,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn message_type(self, message_type: impl Into<String>) -> Self {
        self.attribute(MESSAGE_TYPE_ATTRIBUTE, AttributeValue::string(message_type))
    }

    pub fn visibility_timeout(self, seconds: u32) -> Self {
        self.attribute(VISIBILITY_TIMEOUT_ATTRIBUTE, AttributeValue::number(seconds))
    }

    pub fn delay(mut self, seconds: u32) -> Self {
        self.delay_seconds = seconds;
        self
    }
}
