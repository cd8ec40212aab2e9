//! Dispatcher: wires the poller to a worker pool for one queue.
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! registry.register::<PlaceOrder, _>(PlaceOrderHandler)?;
//!
//! let dispatcher = Dispatcher::new(config, queue, registry)?;
//! let cancel = CancellationToken::new();
//! let running = dispatcher.spawn(cancel.clone());
//! // ...
//! cancel.cancel();
//! let exit = running.await?;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::poller::{Poller, PollerExit};
use crate::pool::{WorkSink, WorkerPool};
use crate::queue::QueueClient;
use crate::registry::HandlerRegistry;

pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    queue: Arc<dyn QueueClient>,
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    /// Validate the configuration and bind it to a queue and registry.
    pub fn new(
        config: DispatcherConfig,
        queue: Arc<dyn QueueClient>,
        registry: HandlerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        if config.queue_name != queue.queue_name() {
            return Err(Error::Config(format!(
                "dispatcher configured for queue {:?} but client reads {:?}",
                config.queue_name,
                queue.queue_name()
            )));
        }
        Ok(Self {
            config: Arc::new(config),
            queue,
            registry: Arc::new(registry),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run until `cancel` fires or the transport fails fatally.
    ///
    /// Returns after the workers have drained or the drain grace period
    /// has passed. A fatal transport error is logged where it happens; the
    /// returned [`PollerExit`] only says why ingestion ended.
    pub async fn run(self, cancel: CancellationToken) -> PollerExit {
        let span = info_span!(
            "dispatcher",
            "messaging.destination.name" = %self.config.queue_name,
            workers = self.config.concurrency_level,
        );

        async move {
            info!(
                message_types = ?self.registry.message_types(),
                scope = ?self.config.handler_scope,
                "dispatcher starting"
            );
            let (pool, ready) = WorkerPool::start(
                Arc::clone(&self.config),
                Arc::clone(&self.queue),
                Arc::clone(&self.registry),
            );
            let sink: Arc<dyn WorkSink> = Arc::new(pool);
            let poller = Poller::new(Arc::clone(&self.config), Arc::clone(&self.queue), sink, ready);

            let exit = poller.execute(cancel).await;
            info!(exit = ?exit, "dispatcher stopped");
            exit
        }
        .instrument(span)
        .await
    }

    /// Run on a background task. The handle completes when [`run`](Self::run) does.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<PollerExit> {
        tokio::spawn(self.run(cancel))
    }
}
