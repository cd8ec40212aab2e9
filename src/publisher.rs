//! Typed publishing: serialize a [`Message`] and stamp its type attribute.

use crate::error::{Error, Result};
use crate::message::OutgoingMessage;
use crate::queue::QueueClient;
use crate::registry::Message;

/// Build the outgoing form of a typed message.
pub fn to_outgoing<M: Message>(message: &M) -> Result<OutgoingMessage> {
    let body = serde_json::to_string(message)
        .map_err(|e| Error::Other(format!("failed to serialize {}: {e}", M::TYPE)))?;
    Ok(OutgoingMessage::new(body).message_type(M::TYPE))
}

/// Send a typed message; returns the queue-assigned id.
pub async fn publish<M: Message>(queue: &dyn QueueClient, message: &M) -> Result<String> {
    queue.send(to_outgoing(message)?).await
}

/// Send a typed message that asks its consumer for a longer visibility timeout.
pub async fn publish_with_visibility<M: Message>(
    queue: &dyn QueueClient,
    message: &M,
    visibility_timeout_seconds: u32,
) -> Result<String> {
    let outgoing = to_outgoing(message)?.visibility_timeout(visibility_timeout_seconds);
    queue.send(outgoing).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MESSAGE_TYPE_ATTRIBUTE, VISIBILITY_TIMEOUT_ATTRIBUTE};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {
        const TYPE: &'static str = "test.ping";
    }

    #[test]
    fn outgoing_carries_type_attribute() {
        let out = to_outgoing(&Ping { seq: 7 }).unwrap();
        assert_eq!(out.body, r#"{"seq":7}"#);
        assert_eq!(
            out.attributes[MESSAGE_TYPE_ATTRIBUTE].string_value,
            "test.ping"
        );
        assert!(!out.attributes.contains_key(VISIBILITY_TIMEOUT_ATTRIBUTE));
    }
}
