//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.set_vt, pgmq.metrics.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::postgres::PgListener;
use tracing::warn;

use super::{Db, READY_CHANNEL};
use crate::error::Result;
use crate::store::{MessageQueue, QueueMessage};
use crate::telemetry::metrics;

fn count(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// pgmq takes whole seconds; round up so a short timeout never becomes zero.
fn whole_seconds(d: Duration) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

#[async_trait]
impl MessageQueue for Db {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(self.pool())
            .await?;
        count(queue, "create");
        Ok(())
    }

    async fn send(&self, queue: &str, payload: &serde_json::Value) -> Result<i64> {
        let mut tx = self.pool().begin().await?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(queue)
            .bind(payload)
            .fetch_one(&mut *tx)
            .await?;

        // NOTIFY is transactional, only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(READY_CHANNEL)
            .bind(queue)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        count(queue, "send");
        Ok(row.0)
    }

    async fn read(&self, queue: &str, visibility: Duration) -> Result<Option<QueueMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue)
        .bind(whole_seconds(visibility))
        .fetch_optional(self.pool())
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| QueueMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        count(queue, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        count(queue, "archive");
        Ok(())
    }

    async fn set_visibility(&self, queue: &str, msg_id: i64, visibility: Duration) -> Result<()> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue)
            .bind(msg_id)
            .bind(whole_seconds(visibility))
            .execute(self.pool())
            .await?;
        count(queue, "set_vt");
        Ok(())
    }

    async fn queue_length(&self, queue: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue)
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }

    /// LISTEN on the ready channel, falling back to the timeout as a poll.
    async fn wait_for_messages(&self, timeout: Duration) {
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            match PgListener::connect_with(self.pool()).await {
                Ok(mut listener) => match listener.listen(READY_CHANNEL).await {
                    Ok(()) => *guard = Some(listener),
                    Err(e) => warn!("LISTEN failed: {e}, polling instead"),
                },
                Err(e) => warn!("PgListener connect failed: {e}, polling instead"),
            }
        }

        let Some(listener) = guard.as_mut() else {
            drop(guard);
            tokio::time::sleep(timeout).await;
            return;
        };

        match tokio::time::timeout(timeout, listener.recv()).await {
            Ok(Ok(_)) | Err(_) => {}
            Ok(Err(e)) => {
                warn!("PgListener error: {e}, reconnecting on next wait");
                *guard = None;
            }
        }
    }
}
