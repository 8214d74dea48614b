//! In-process backend.
//!
//! Implements every backend trait over mutex-guarded maps. Queue semantics
//! follow pgmq: reads hide a message for the visibility timeout and bump
//! `read_ct`; unarchived messages come back once the timeout passes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use super::{MessageQueue, OwnershipRegistry, QueueMessage, ResponseLog, ThreadStore};
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Default)]
struct Queue {
    next_id: i64,
    messages: VecDeque<QueueMessage>,
    archived: Vec<QueueMessage>,
}

/// Every mailroom backend trait, in memory.
#[derive(Default)]
pub struct MemoryBackend {
    claims: Mutex<BTreeMap<PairKey, OwnershipClaim>>,
    queues: Mutex<HashMap<String, Queue>>,
    threads: Mutex<HashMap<ThreadId, Thread>>,
    responses: Mutex<HashMap<CorrelationId, ResponseMessage>>,
    ready: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived messages of a queue, oldest first.
    pub async fn archived(&self, queue: &str) -> Vec<QueueMessage> {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.archived.clone())
            .unwrap_or_default()
    }

    /// Payloads of a queue's unarchived messages, visible or not, oldest first.
    pub async fn pending(&self, queue: &str) -> Vec<serde_json::Value> {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }
}

fn lease_end(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| Error::Config(format!("lease out of range: {e}")))?;
    Ok(now + lease)
}

fn visible_at(now: DateTime<Utc>, visibility: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(visibility).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn is_current(claim: &OwnershipClaim, ctx: &ClaimContext, now: DateTime<Utc>) -> bool {
    claim.is_live(now) && claim.owner_id == ctx.worker_id && claim.claim_token == ctx.claim_token
}

#[async_trait]
impl OwnershipRegistry for MemoryBackend {
    async fn try_claim(
        &self,
        pair: &PairKey,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimResult> {
        let now = Utc::now();
        let mut claims = self.claims.lock().await;

        if let Some(existing) = claims.get(pair).filter(|c| c.is_live(now)) {
            return Ok(ClaimResult::AlreadyOwned {
                owner: existing.owner_id.clone(),
            });
        }

        let claim = OwnershipClaim {
            pair: pair.clone(),
            owner_id: worker.clone(),
            claim_token: ClaimToken::new(),
            claimed_at: now,
            lease_expires_at: lease_end(now, lease)?,
            released_at: None,
            input_queue: pair.input_queue(),
            output_queue: pair.output_queue(),
        };
        claims.insert(pair.clone(), claim.clone());
        Ok(ClaimResult::Acquired(claim))
    }

    async fn renew(&self, ctx: &ClaimContext, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut claims = self.claims.lock().await;
        match claims.get_mut(&ctx.pair) {
            Some(claim) if is_current(claim, ctx, now) => {
                claim.lease_expires_at = lease_end(now, lease)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, ctx: &ClaimContext) -> Result<bool> {
        let now = Utc::now();
        let mut claims = self.claims.lock().await;
        match claims.get_mut(&ctx.pair) {
            Some(claim) if is_current(claim, ctx, now) => {
                claim.released_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_owned_by(&self, pair: &PairKey, worker: &WorkerId) -> Result<bool> {
        let now = Utc::now();
        let claims = self.claims.lock().await;
        Ok(claims
            .get(pair)
            .is_some_and(|c| c.is_live(now) && &c.owner_id == worker))
    }

    async fn current_claim(&self, pair: &PairKey) -> Result<Option<OwnershipClaim>> {
        let now = Utc::now();
        let claims = self.claims.lock().await;
        Ok(claims.get(pair).filter(|c| c.is_live(now)).cloned())
    }

    async fn list_claims(&self) -> Result<Vec<OwnershipClaim>> {
        Ok(self.claims.lock().await.values().cloned().collect())
    }
}

#[async_trait]
impl MessageQueue for MemoryBackend {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, payload: &serde_json::Value) -> Result<i64> {
        let now = Utc::now();
        let msg_id = {
            let mut queues = self.queues.lock().await;
            let q = queues
                .get_mut(queue)
                .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;
            q.next_id += 1;
            q.messages.push_back(QueueMessage {
                msg_id: q.next_id,
                read_ct: 0,
                enqueued_at: now,
                vt: now,
                message: payload.clone(),
            });
            q.next_id
        };
        self.ready.notify_waiters();
        Ok(msg_id)
    }

    async fn read(&self, queue: &str, visibility: Duration) -> Result<Option<QueueMessage>> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;
        let Some(msg) = q.messages.iter_mut().find(|m| m.vt <= now) else {
            return Ok(None);
        };
        msg.read_ct += 1;
        msg.vt = visible_at(now, visibility);
        Ok(Some(msg.clone()))
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;
        if let Some(pos) = q.messages.iter().position(|m| m.msg_id == msg_id) {
            if let Some(msg) = q.messages.remove(pos) {
                q.archived.push(msg);
            }
        }
        Ok(())
    }

    async fn set_visibility(&self, queue: &str, msg_id: i64, visibility: Duration) -> Result<()> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;
        if let Some(msg) = q.messages.iter_mut().find(|m| m.msg_id == msg_id) {
            msg.vt = visible_at(now, visibility);
        }
        Ok(())
    }

    async fn queue_length(&self, queue: &str) -> Result<i64> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or(0, |q| q.messages.len() as i64))
    }

    async fn wait_for_messages(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.ready.notified()).await;
    }
}

#[async_trait]
impl ThreadStore for MemoryBackend {
    async fn insert_thread(&self, thread: &Thread) -> Result<()> {
        self.threads
            .lock()
            .await
            .insert(thread.thread_id, thread.clone());
        Ok(())
    }

    async fn get_thread(&self, id: ThreadId) -> Result<Option<Thread>> {
        Ok(self.threads.lock().await.get(&id).cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Thread>> {
        let threads = self.threads.lock().await;
        Ok(threads
            .values()
            .find(|t| t.continuity_token() == token)
            .cloned())
    }

    async fn recent_for_origin(
        &self,
        origin: &str,
        pair: &PairKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<Thread>> {
        let threads = self.threads.lock().await;
        let mut found: Vec<Thread> = threads
            .values()
            .filter(|t| {
                t.origin_address.eq_ignore_ascii_case(origin)
                    && &t.pair == pair
                    && t.last_activity_at >= since
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(found)
    }

    async fn touch(&self, id: ThreadId, at: DateTime<Utc>) -> Result<()> {
        let mut threads = self.threads.lock().await;
        let thread = threads
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("thread {id}")))?;
        if at > thread.last_activity_at {
            thread.last_activity_at = at;
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseLog for MemoryBackend {
    async fn record_response(&self, response: &ResponseMessage) -> Result<()> {
        self.responses
            .lock()
            .await
            .entry(response.correlation_id)
            .or_insert_with(|| response.clone());
        Ok(())
    }

    async fn find_response(&self, correlation_id: CorrelationId) -> Result<Option<ResponseMessage>> {
        Ok(self.responses.lock().await.get(&correlation_id).cloned())
    }
}
