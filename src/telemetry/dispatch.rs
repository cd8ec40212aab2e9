//! Per-message dispatch spans.

use tracing::Span;

/// Why a message was left on the queue instead of acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    MissingType,
    OutOfScope,
    UnknownType,
    Undecodable,
    NoHandler,
    HandlerFailed,
    AckFailed,
}

impl AbandonReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingType => "missing_type",
            Self::OutOfScope => "out_of_scope",
            Self::UnknownType => "unknown_type",
            Self::Undecodable => "undecodable",
            Self::NoHandler => "no_handler",
            Self::HandlerFailed => "handler_failed",
            Self::AckFailed => "ack_failed",
        }
    }
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start the span covering one message from dequeue to ack or abandon.
///
/// `message.type` starts empty and is filled once the discriminator is read.
pub fn start_message_span(queue: &str, message_id: &str, worker_id: usize) -> Span {
    tracing::info_span!(
        "message.dispatch",
        "messaging.destination.name" = queue,
        "messaging.message.id" = message_id,
        "worker.id" = worker_id,
        "message.type" = tracing::field::Empty,
        "message.outcome" = tracing::field::Empty,
    )
}

pub fn record_message_type(span: &Span, message_type: &str) {
    span.record("message.type", message_type);
}

/// Record the final outcome on the span.
pub fn record_outcome(span: &Span, outcome: Result<(), AbandonReason>) {
    match outcome {
        Ok(()) => {
            span.record("message.outcome", "acked");
        }
        Err(reason) => {
            span.record("message.outcome", reason.as_str());
        }
    }
}
