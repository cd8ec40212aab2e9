//! # dispatchq
//!
//! Long-polling message-queue consumer. A single poller receives batches
//! from a queue, a fixed pool of workers dispatches each message to the
//! handler registered for its type, and successfully handled messages are
//! deleted. Anything else is left for the queue to redeliver.
//!
//! Ships a pgmq (Postgres) transport and an in-memory one, with tracing and
//! OpenTelemetry export.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod message;
pub mod poller;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod telemetry;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use message::{Envelope, OutgoingMessage};
pub use queue::QueueClient;
pub use registry::{Handler, HandlerError, HandlerRegistry, Message};
