//! Backend seams.
//!
//! The dispatcher and worker runtime only see these traits. Two backends
//! implement all of them: [`crate::db::Db`] (Postgres + pgmq) and
//! [`memory::MemoryBackend`] (in-process, for tests and single-node use).

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;

/// The durable, strongly-consistent table of who owns which pair.
#[async_trait]
pub trait OwnershipRegistry: Send + Sync {
    /// Atomically create a claim unless a live one exists.
    async fn try_claim(
        &self,
        pair: &PairKey,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimResult>;

    /// Extend the lease. False if the caller no longer owns the pair.
    async fn renew(&self, ctx: &ClaimContext, lease: Duration) -> Result<bool>;

    /// Give the pair back. False if the caller no longer owns the pair.
    async fn release(&self, ctx: &ClaimContext) -> Result<bool>;

    async fn is_owned_by(&self, pair: &PairKey, worker: &WorkerId) -> Result<bool>;

    /// The live claim on a pair, if any.
    async fn current_claim(&self, pair: &PairKey) -> Result<Option<OwnershipClaim>>;

    /// Every claim row, live or not.
    async fn list_claims(&self) -> Result<Vec<OwnershipClaim>>;
}

/// A message read from a queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub vt: DateTime<Utc>,
    pub message: serde_json::Value,
}

/// Visibility-timeout queues with pgmq semantics: a read hides the message
/// for the timeout, after which it is redelivered unless archived.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Create a queue (idempotent).
    async fn create_queue(&self, queue: &str) -> Result<()>;

    /// Send a message. Returns the message ID.
    async fn send(&self, queue: &str, payload: &serde_json::Value) -> Result<i64>;

    /// Read the oldest visible message, hiding it for `visibility`.
    async fn read(&self, queue: &str, visibility: Duration) -> Result<Option<QueueMessage>>;

    /// Remove a message from the queue, keeping it for audit.
    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()>;

    /// Push a message's visibility out to `visibility` from now.
    async fn set_visibility(&self, queue: &str, msg_id: i64, visibility: Duration) -> Result<()>;

    /// Messages currently in the queue, visible or not.
    async fn queue_length(&self, queue: &str) -> Result<i64>;

    /// Resolves when new messages may be available, or after `timeout`.
    async fn wait_for_messages(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

/// Persistent thread rows, owned by the resolver.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn insert_thread(&self, thread: &Thread) -> Result<()>;

    async fn get_thread(&self, id: ThreadId) -> Result<Option<Thread>>;

    async fn find_by_token(&self, token: &str) -> Result<Option<Thread>>;

    /// Threads from `origin` on `pair` active at or after `since`.
    async fn recent_for_origin(
        &self,
        origin: &str,
        pair: &PairKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<Thread>>;

    /// Bump `last_activity_at`.
    async fn touch(&self, id: ThreadId, at: DateTime<Utc>) -> Result<()>;
}

/// Record of every response produced, keyed by correlation id.
#[async_trait]
pub trait ResponseLog: Send + Sync {
    /// Store a response. A second record for the same correlation id is ignored.
    async fn record_response(&self, response: &ResponseMessage) -> Result<()>;

    async fn find_response(&self, correlation_id: CorrelationId) -> Result<Option<ResponseMessage>>;
}

/// Send a payload to the dead-letter queue.
pub async fn dead_letter(
    queue: &dyn MessageQueue,
    source: &str,
    reason: impl Into<String>,
    payload: serde_json::Value,
) -> Result<i64> {
    let letter = DeadLetter::new(source, reason, payload);
    queue
        .send(DEAD_LETTER_QUEUE, &serde_json::to_value(&letter)?)
        .await
}
