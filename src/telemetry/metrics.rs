//! Metric instruments for dispatchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint these are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry_semantic_conventions::attribute::MESSAGING_DESTINATION_NAME;

fn meter() -> Meter {
    opentelemetry::global::meter("dispatchq")
}

/// Counter: messages handed to the worker pool.
/// Labels: `messaging.destination.name`.
pub fn messages_received() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.messages.received")
        .with_description("Messages received from the queue")
        .build()
}

/// Counter: messages that finished local processing.
/// Labels: `messaging.destination.name`, `outcome` ("acked" or an abandon reason).
pub fn messages_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.messages.dispatched")
        .with_description("Messages processed by a worker, by outcome")
        .build()
}

/// Counter: transport operations (read, delete, set_vt, send, create).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: handler wall time in milliseconds.
/// Labels: `message.type`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatchq.handler.duration_ms")
        .with_description("Handler duration in milliseconds")
        .with_unit("ms")
        .build()
}

pub fn destination(queue: &str) -> KeyValue {
    KeyValue::new(MESSAGING_DESTINATION_NAME, queue.to_string())
}
