//! Handler registry: message type discriminators mapped to handlers.
//!
//! Built once at startup with explicit `register` calls, then shared
//! read-only with the worker pool. Resolution is a plain map lookup.
//!
//! Two layers:
//! - **Typed**: [`Message`] and [`Handler<M>`], what application code writes.
//! - **Erased**: [`DynHandler`] and [`MessageType`], what the pool dispatches on.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Error type handlers return. Any error means "do not ack".
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A message type with a stable discriminator.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct PlaceOrder { sku: String }
///
/// impl Message for PlaceOrder {
///     const TYPE: &'static str = "orders.place_order";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Value carried in the type-discriminator attribute.
    const TYPE: &'static str;
}

/// Handles one message type.
#[async_trait]
pub trait Handler<M: Message>: Send + Sync {
    /// Returning `Ok` acks the message; `Err` leaves it for redelivery.
    async fn handle(&self, message: M, cancel: CancellationToken) -> std::result::Result<(), HandlerError>;
}

/// A decoded message whose concrete type is known only to its handler.
pub struct DecodedMessage(Box<dyn Any + Send>);

/// Object-safe handler over a [`DecodedMessage`].
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        message: DecodedMessage,
        cancel: CancellationToken,
    ) -> std::result::Result<(), HandlerError>;

    fn message_type(&self) -> &'static str;
}

struct TypedHandler<M: Message, H: Handler<M>> {
    handler: H,
    _marker: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M: Message, H: Handler<M>> DynHandler for TypedHandler<M, H> {
    async fn handle_dyn(
        &self,
        message: DecodedMessage,
        cancel: CancellationToken,
    ) -> std::result::Result<(), HandlerError> {
        let message = message
            .0
            .downcast::<M>()
            .map_err(|_| format!("decoded message is not a {}", M::TYPE))?;
        self.handler.handle(*message, cancel).await
    }

    fn message_type(&self) -> &'static str {
        M::TYPE
    }
}

type DecodeFn = fn(&str) -> Result<DecodedMessage>;

fn decode_json<M: Message>(body: &str) -> Result<DecodedMessage> {
    let message: M = serde_json::from_str(body)
        .map_err(|e| Error::Decode(format!("{} body: {e}", M::TYPE)))?;
    Ok(DecodedMessage(Box::new(message)))
}

/// A known message type: its name and how to decode a body into it.
#[derive(Clone, Copy)]
pub struct MessageType {
    name: &'static str,
    decode: DecodeFn,
}

impl MessageType {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn decode(&self, body: &str) -> Result<DecodedMessage> {
        (self.decode)(body)
    }
}

impl std::fmt::Debug for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageType").field("name", &self.name).finish()
    }
}

/// Registry of message types and their handlers.
///
/// A type can be declared without a handler; messages of that type decode
/// but are abandoned with "no handler registered".
#[derive(Default)]
pub struct HandlerRegistry {
    types: HashMap<&'static str, MessageType>,
    handlers: HashMap<&'static str, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `M` resolvable without attaching a handler.
    pub fn declare<M: Message>(&mut self) -> &mut Self {
        self.types.entry(M::TYPE).or_insert(MessageType {
            name: M::TYPE,
            decode: decode_json::<M>,
        });
        self
    }

    /// Register the handler for `M`. Each type takes exactly one handler.
    pub fn register<M: Message, H: Handler<M> + 'static>(&mut self, handler: H) -> Result<&mut Self> {
        if self.handlers.contains_key(M::TYPE) {
            return Err(Error::Registry(format!(
                "duplicate handler for message type {}",
                M::TYPE
            )));
        }
        self.declare::<M>();
        self.handlers.insert(
            M::TYPE,
            Arc::new(TypedHandler {
                handler,
                _marker: PhantomData,
            }),
        );
        Ok(self)
    }

    /// Look up a message type by discriminator.
    pub fn resolve_type(&self, discriminator: &str) -> Option<MessageType> {
        self.types.get(discriminator).copied()
    }

    /// Look up the handler for a discriminator.
    pub fn resolve(&self, discriminator: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(discriminator).cloned()
    }

    pub fn message_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.types.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Whether `discriminator` falls inside `scope`.
///
/// A scope is a dotted namespace prefix: scope `orders` admits `orders` and
/// `orders.place_order` but not `ordersv2.place_order`. No scope admits all.
pub fn within_scope(discriminator: &str, scope: Option<&str>) -> bool {
    match scope {
        None => true,
        Some(scope) => {
            discriminator == scope
                || discriminator
                    .strip_prefix(scope)
                    .is_some_and(|rest| rest.starts_with('.'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        const TYPE: &'static str = "test.ping";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong {}

    impl Message for Pong {
        const TYPE: &'static str = "test.pong";
    }

    #[derive(Default)]
    struct SumPings(AtomicU32);

    #[async_trait]
    impl Handler<Ping> for Arc<SumPings> {
        async fn handle(&self, message: Ping, _cancel: CancellationToken) -> std::result::Result<(), HandlerError> {
            self.0.fetch_add(message.n, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_then_dispatch_roundtrip() {
        let sum = Arc::new(SumPings::default());
        let mut registry = HandlerRegistry::new();
        registry.register::<Ping, _>(Arc::clone(&sum)).unwrap();

        let ty = registry.resolve_type("test.ping").unwrap();
        let decoded = ty.decode(r#"{"n": 5}"#).unwrap();
        let handler = registry.resolve("test.ping").unwrap();
        handler.handle_dyn(decoded, CancellationToken::new()).await.unwrap();

        assert_eq!(sum.0.load(Ordering::SeqCst), 5);
        assert_eq!(handler.message_type(), "test.ping");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Ping, _>(Arc::new(SumPings::default())).unwrap();
        let err = registry
            .register::<Ping, _>(Arc::new(SumPings::default()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Registry(_)));
    }

    #[test]
    fn declared_type_has_no_handler() {
        let mut registry = HandlerRegistry::new();
        registry.declare::<Pong>();
        assert!(registry.resolve_type(Pong::TYPE).is_some());
        assert!(registry.resolve(Pong::TYPE).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn decode_failure_is_a_decode_error() {
        let mut registry = HandlerRegistry::new();
        registry.declare::<Ping>();
        let err = registry
            .resolve_type(Ping::TYPE)
            .unwrap()
            .decode("not json")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn scope_is_a_dotted_prefix() {
        assert!(within_scope("orders.place", Some("orders")));
        assert!(within_scope("orders", Some("orders")));
        assert!(!within_scope("ordersv2.place", Some("orders")));
        assert!(!within_scope("billing.charge", Some("orders")));
        assert!(within_scope("anything", None));
    }

    #[test]
    fn message_types_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.declare::<Pong>().declare::<Ping>();
        assert_eq!(registry.message_types(), vec!["test.ping", "test.pong"]);
    }
}
