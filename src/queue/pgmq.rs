//! pgmq transport via direct SQLx.
//!
//! Create, send, and receive go through pgmq's SQL functions (pgmq.create,
//! pgmq.send, pgmq.read, pgmq.read_with_poll). Delete and visibility
//! changes run against the queue table directly and match both `msg_id`
//! and `read_ct`, so a receipt from an earlier receive cannot touch a
//! message that has since been redelivered.
//!
//! Each pgmq payload is a JSON object `{"body": "...", "attributes": {...}}`.
//! Payloads from other producers that lack this shape are passed through
//! with the raw JSON as body and no attributes.

use std::collections::HashMap;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use super::{QueueClient, ReceiveRequest, retain_requested};
use crate::error::{Error, Result};
use crate::message::{AttributeValue, Envelope, OutgoingMessage, ReceiptHandle};
use crate::telemetry::metrics;

/// Interval between pgmq's internal polls during a long-poll read.
const POLL_INTERVAL_MS: i32 = 100;

#[derive(Debug, Serialize, Deserialize)]
struct WirePayload {
    body: String,
    #[serde(default)]
    attributes: HashMap<String, AttributeValue>,
}

type MessageRow = (i64, i32, chrono::DateTime<chrono::Utc>, serde_json::Value);

/// Queue client backed by a pgmq queue.
pub struct PgmqQueue {
    pool: PgPool,
    queue_name: String,
}

impl PgmqQueue {
    /// Connect to Postgres and bind to `queue_name`.
    pub async fn connect(url: &str, queue_name: impl Into<String>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool, queue_name))
    }

    pub fn from_pool(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Create the pgmq queue (idempotent).
    pub async fn create_queue(&self) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await?;
        self.count("create");
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn count(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.queue_name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    async fn read(&self, request: &ReceiveRequest) -> Result<Vec<MessageRow>> {
        let vt = to_i32(request.visibility_timeout_seconds);
        let qty = to_i32(request.max_messages.max(1));

        let rows = if request.wait_seconds == 0 {
            sqlx::query_as::<_, MessageRow>(
                "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, $3)",
            )
            .bind(&self.queue_name)
            .bind(vt)
            .bind(qty)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, MessageRow>(
                "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read_with_poll($1, $2, $3, $4, $5)",
            )
            .bind(&self.queue_name)
            .bind(vt)
            .bind(qty)
            .bind(to_i32(request.wait_seconds))
            .bind(POLL_INTERVAL_MS)
            .fetch_all(&self.pool)
            .await
        };

        rows.map_err(|e| Error::from_sqlx("receive", e))
    }
}

#[async_trait]
impl QueueClient for PgmqQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn receive_batch(
        &self,
        request: &ReceiveRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>> {
        let rows = tokio::select! {
            rows = self.read(request) => rows?,
            _ = cancel.cancelled() => return Ok(Vec::new()),
        };

        self.count(if rows.is_empty() { "read_empty" } else { "read" });

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut envelope = to_envelope(row);
                retain_requested(&mut envelope, &request.attribute_names);
                envelope
            })
            .collect())
    }

    async fn delete(&self, receipt: &ReceiptHandle, _cancel: &CancellationToken) -> Result<()> {
        let (msg_id, read_ct) = parse_receipt(receipt)?;
        let sql = format!(
            "DELETE FROM {} WHERE msg_id = $1 AND read_ct = $2 RETURNING msg_id",
            queue_table(&self.queue_name)?
        );
        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(msg_id)
            .bind(read_ct)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::from_sqlx("delete", e))?;
        self.count("delete");

        match row {
            Some(_) => Ok(()),
            None => Err(stale_receipt("delete", receipt)),
        }
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        seconds: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (msg_id, read_ct) = parse_receipt(receipt)?;
        let sql = format!(
            "UPDATE {} SET vt = clock_timestamp() + make_interval(secs => $3) \
             WHERE msg_id = $1 AND read_ct = $2 RETURNING msg_id",
            queue_table(&self.queue_name)?
        );
        let query = sqlx::query_as::<_, (i64,)>(&sql)
            .bind(msg_id)
            .bind(read_ct)
            .bind(f64::from(seconds))
            .fetch_optional(&self.pool);

        let row = tokio::select! {
            row = query => row.map_err(|e| Error::from_sqlx("extend_visibility", e))?,
            _ = cancel.cancelled() => {
                return Err(Error::transient("extend_visibility", "cancelled"));
            }
        };
        self.count("set_vt");

        match row {
            Some(_) => Ok(()),
            None => Err(stale_receipt("extend_visibility", receipt)),
        }
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String> {
        let payload = serde_json::to_value(WirePayload {
            body: message.body,
            attributes: message.attributes,
        })
        .map_err(|e| Error::Other(format!("serialize payload: {e}")))?;

        let (msg_id,): (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(&self.queue_name)
            .bind(&payload)
            .bind(to_i32(message.delay_seconds))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::from_sqlx("send", e))?;
        self.count("send");
        Ok(msg_id.to_string())
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Receipt handles are `{msg_id}:{read_ct}`.
fn parse_receipt(receipt: &ReceiptHandle) -> Result<(i64, i32)> {
    receipt
        .0
        .split_once(':')
        .and_then(|(id, read_ct)| Some((id.parse().ok()?, read_ct.parse().ok()?)))
        .ok_or_else(|| Error::Decode(format!("malformed pgmq receipt handle {receipt}")))
}

/// The table pgmq keeps a queue's messages in. pgmq folds names to lower case.
fn queue_table(queue_name: &str) -> Result<String> {
    let valid = !queue_name.is_empty()
        && queue_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::Config(format!(
            "pgmq queue name {queue_name:?} must be letters, digits, and underscores"
        )));
    }
    Ok(format!("pgmq.\"q_{}\"", queue_name.to_ascii_lowercase()))
}

fn stale_receipt(operation: &'static str, receipt: &ReceiptHandle) -> Error {
    Error::transient(
        operation,
        format!("receipt {receipt} is stale or the message is gone"),
    )
}

fn to_envelope((msg_id, read_ct, enqueued_at, message): MessageRow) -> Envelope {
    let (body, attributes) = match serde_json::from_value::<WirePayload>(message.clone()) {
        Ok(payload) => (payload.body, payload.attributes),
        Err(_) => (message.to_string(), HashMap::new()),
    };

    Envelope {
        id: msg_id.to_string(),
        body,
        attributes,
        receipt_handle: ReceiptHandle(format!("{msg_id}:{read_ct}")),
        receive_count: u32::try_from(read_ct).unwrap_or(0),
        sent_at: Some(enqueued_at),
    }
}
