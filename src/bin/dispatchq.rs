//! dispatchq CLI: run the consumer, produce demo traffic, manage queues.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dispatchq::config::secrets::ExposeSecret;
use dispatchq::config::{Config, DispatcherConfig};
use dispatchq::publisher::to_outgoing;
use dispatchq::queue::PgmqQueue;
use dispatchq::registry::{Handler, HandlerError, HandlerRegistry, Message};
use dispatchq::telemetry::{TelemetryConfig, init_telemetry};
use dispatchq::{Dispatcher, QueueClient};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dispatchq", about = "Long-polling message-queue consumer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the queue with the demo order handler
    Serve {
        /// TOML file with a [dispatcher] table (overrides DISPATCHQ_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Queue to consume (overrides the config file)
        #[arg(long)]
        queue: Option<String>,
        /// Number of workers (overrides the config file)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Publish demo PlaceOrder messages
    Send {
        #[arg(long, default_value = "dispatch")]
        queue: String,
        /// Number of messages to publish
        #[arg(long, default_value_t = 100)]
        count: u32,
        /// Ask the consumer to hide each message for this many seconds
        #[arg(long)]
        visibility_timeout: Option<u32>,
        /// Hold each message back this many seconds before it becomes visible
        #[arg(long, default_value_t = 0)]
        delay: u32,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Create a queue if it does not exist
    Create { name: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct PlaceOrder {
    order_id: Uuid,
    sku: String,
    quantity: u32,
}

impl Message for PlaceOrder {
    const TYPE: &'static str = "orders.place_order";
}

struct PlaceOrderHandler;

#[async_trait]
impl Handler<PlaceOrder> for PlaceOrderHandler {
    async fn handle(
        &self,
        order: PlaceOrder,
        _cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        info!(order_id = %order.order_id, sku = %order.sku, quantity = order.quantity, "order placed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let mut telemetry = TelemetryConfig::new("dispatchq");
    telemetry.endpoint = config.otel_endpoint.clone();
    telemetry.default_filter = config.log_level.clone();
    let _guard = init_telemetry(telemetry)?;

    match cli.command {
        Command::Serve {
            config: path,
            queue,
            concurrency,
        } => cmd_serve(&config, path, queue, concurrency).await,
        Command::Send {
            queue,
            count,
            visibility_timeout,
            delay,
        } => cmd_send(&config, queue, count, visibility_timeout, delay).await,
        Command::Queue {
            action: QueueAction::Create { name },
        } => {
            let queue = PgmqQueue::connect(config.database_url.expose_secret(), &name).await?;
            queue.create_queue().await?;
            println!("Queue ready: {name}");
            Ok(())
        }
    }
}

async fn cmd_serve(
    config: &Config,
    path: Option<PathBuf>,
    queue: Option<String>,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let mut dispatcher_config = match path.or_else(|| config.dispatcher_config.clone()) {
        Some(path) => DispatcherConfig::load(&path)?,
        None => DispatcherConfig::default(),
    }
    .apply_env_overrides()?;
    if let Some(queue) = queue {
        dispatcher_config.queue_name = queue;
    }
    if let Some(concurrency) = concurrency {
        dispatcher_config.concurrency_level = concurrency;
    }

    let queue = PgmqQueue::connect(
        config.database_url.expose_secret(),
        &dispatcher_config.queue_name,
    )
    .await?;
    queue.create_queue().await?;

    let mut registry = HandlerRegistry::new();
    registry.register::<PlaceOrder, _>(PlaceOrderHandler)?;

    let dispatcher = Dispatcher::new(dispatcher_config, Arc::new(queue), registry)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, shutting down");
        on_signal.cancel();
    });

    let exit = dispatcher.run(cancel).await;
    info!(?exit, "consumer stopped");
    Ok(())
}

async fn cmd_send(
    config: &Config,
    queue_name: String,
    count: u32,
    visibility_timeout: Option<u32>,
    delay: u32,
) -> anyhow::Result<()> {
    let queue = PgmqQueue::connect(config.database_url.expose_secret(), &queue_name).await?;
    queue.create_queue().await?;
    let client: &dyn QueueClient = &queue;

    for i in 0..count {
        let order = PlaceOrder {
            order_id: Uuid::new_v4(),
            sku: format!("SKU-{:04}", i % 50),
            quantity: i % 5 + 1,
        };
        let mut outgoing = to_outgoing(&order)?.delay(delay);
        if let Some(seconds) = visibility_timeout {
            outgoing = outgoing.visibility_timeout(seconds);
        }
        client.send(outgoing).await?;
    }

    println!("Sent {count} {} message(s) to {queue_name}", PlaceOrder::TYPE);
    Ok(())
}
