//! Control loop: watch for unclaimed pairs, claim them, spawn their runners.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::event::{Event, EventBus, EventKind};
use super::pair::PairRunner;
use super::{Backends, Pipeline, Runtime, WorkerConfig};
use crate::dispatch::{ensure_pair_queues, ensure_shared_queues, request_claim};
use crate::error::Result;
use crate::model::*;
use crate::store::{self, QueueMessage};

/// A worker process: claims pairs up to `max_pairs` and runs each one.
#[derive(Clone)]
pub struct Worker {
    runtime: Arc<Runtime>,
    shutdown: CancellationToken,
    runners: TaskTracker,
    /// Pairs with a live runner here, and the claim each runs under.
    active: Arc<Mutex<HashMap<PairKey, ClaimToken>>>,
}

impl Worker {
    pub fn new(backends: Backends, pipeline: Pipeline, config: WorkerConfig) -> Self {
        Self {
            runtime: Arc::new(Runtime {
                backends,
                pipeline,
                config,
                events: EventBus::default(),
            }),
            shutdown: CancellationToken::new(),
            runners: TaskTracker::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.runtime.config.worker_id
    }

    /// Subscribe to this worker's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.runtime.events.subscribe()
    }

    /// Signal the worker to stop. Runners release their pairs and `run`
    /// returns once they have.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Pairs this worker currently owns.
    pub async fn active_pairs(&self) -> Vec<PairKey> {
        let mut pairs: Vec<_> = self.active.lock().await.keys().cloned().collect();
        pairs.sort();
        pairs
    }

    /// Run the control loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        let queue = self.runtime.backends.queue.as_ref();
        let config = &self.runtime.config;
        ensure_shared_queues(queue).await?;

        info!(
            worker = %config.worker_id,
            max_pairs = config.max_pairs,
            "worker started, watching for unclaimed pairs"
        );

        let mut next_sweep = Instant::now() + config.lease;
        loop {
            // Claim as much as capacity allows (whether notified or polling).
            while !self.shutdown.is_cancelled() {
                match self.claim_next().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!("claim_next error: {e}");
                        break;
                    }
                }
            }

            if Instant::now() >= next_sweep {
                if let Err(e) = self.recover_orphans().await {
                    warn!("orphan sweep failed: {e}");
                }
                next_sweep = Instant::now() + config.lease;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = queue.wait_for_messages(config.poll_interval) => {}
            }
        }

        info!(worker = %config.worker_id, "worker shutting down, waiting for pairs");
        self.runners.close();
        self.runners.wait().await;
        info!(worker = %config.worker_id, "worker stopped");
        Ok(())
    }

    /// Handle one claim request. False when there is nothing to do or no
    /// room to do it.
    async fn claim_next(&self) -> Result<bool> {
        let config = &self.runtime.config;
        let backends = &self.runtime.backends;
        if self.active.lock().await.len() >= config.max_pairs {
            return Ok(false);
        }

        let Some(msg) = backends
            .queue
            .read(UNCLAIMED_QUEUE, config.claim_visibility)
            .await?
        else {
            return Ok(false);
        };

        let request: ClaimRequest = match serde_json::from_value(msg.message.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(msg_id = msg.msg_id, "malformed claim request, dead-lettering");
                store::dead_letter(
                    backends.queue.as_ref(),
                    UNCLAIMED_QUEUE,
                    format!("malformed claim request: {e}"),
                    msg.message,
                )
                .await?;
                backends.queue.archive(UNCLAIMED_QUEUE, msg.msg_id).await?;
                return Ok(true);
            }
        };
        let pair = request.pair();

        ensure_pair_queues(backends.queue.as_ref(), &pair).await?;

        if self.window_exceeded(&msg, &request)
            && backends.registry.current_claim(&pair).await?.is_none()
        {
            self.abandon(&pair, msg).await?;
            return Ok(true);
        }

        match backends
            .registry
            .try_claim(&pair, &config.worker_id, config.lease)
            .await
        {
            Ok(ClaimResult::Acquired(claim)) => {
                self.spawn_runner(claim, request.source_ref).await;
                backends.queue.archive(UNCLAIMED_QUEUE, msg.msg_id).await?;
                Ok(true)
            }
            Ok(ClaimResult::AlreadyOwned { owner }) => {
                // The owner drains the input queue.
                debug!(%pair, %owner, "pair already owned");
                backends.queue.archive(UNCLAIMED_QUEUE, msg.msg_id).await?;
                Ok(true)
            }
            Err(e) => {
                warn!(%pair, error = %e, "claim attempt failed, request will be redelivered");
                Ok(false)
            }
        }
    }

    fn window_exceeded(&self, msg: &QueueMessage, request: &ClaimRequest) -> bool {
        let config = &self.runtime.config;
        let age = (Utc::now() - request.requested_at).to_std().unwrap_or_default();
        msg.read_ct > config.max_claim_attempts || age > config.claim_window
    }

    /// Nobody managed to claim the pair in time: park its claim request and
    /// every pending work message in the dead-letter queue.
    async fn abandon(&self, pair: &PairKey, msg: QueueMessage) -> Result<()> {
        let queue = self.runtime.backends.queue.as_ref();
        let input = pair.input_queue();
        warn!(%pair, read_ct = msg.read_ct, "claim window exceeded, dead-lettering pending work");

        let mut parked = 0;
        while let Some(work) = queue.read(&input, self.runtime.config.claim_visibility).await? {
            store::dead_letter(queue, &input, "no worker claimed the pair in time", work.message)
                .await?;
            queue.archive(&input, work.msg_id).await?;
            parked += 1;
        }
        store::dead_letter(queue, UNCLAIMED_QUEUE, "claim window exceeded", msg.message).await?;
        queue.archive(UNCLAIMED_QUEUE, msg.msg_id).await?;
        info!(%pair, parked, "pair abandoned");
        Ok(())
    }

    /// Re-request claims for pairs whose owner vanished with work queued.
    async fn recover_orphans(&self) -> Result<()> {
        let backends = &self.runtime.backends;
        let now = Utc::now();
        for claim in backends.registry.list_claims().await? {
            if claim.released_at.is_some() || claim.lease_expires_at > now {
                continue;
            }
            if self.active.lock().await.contains_key(&claim.pair) {
                continue;
            }
            let pending = backends.queue.queue_length(&claim.input_queue).await?;
            if pending > 0 {
                info!(pair = %claim.pair, previous_owner = %claim.owner_id, pending, "re-requesting orphaned pair");
                request_claim(backends.queue.as_ref(), &claim.pair, "").await?;
            }
        }
        Ok(())
    }

    async fn spawn_runner(&self, claim: OwnershipClaim, source_ref: String) {
        let pair = claim.pair.clone();
        let token = claim.claim_token;
        self.active.lock().await.insert(pair.clone(), token);
        self.runtime.events.emit(EventKind::PairClaimed {
            pair: pair.clone(),
            worker_id: claim.owner_id.clone(),
        });
        info!(%pair, worker = %claim.owner_id, "pair claimed, runner spawned");

        let runner = PairRunner::new(
            self.runtime.clone(),
            claim.context(),
            source_ref,
            self.shutdown.clone(),
        );
        let active = self.active.clone();
        self.runners.spawn(async move {
            let exit = runner.run().await;
            // A fresh claim on the same pair may already have replaced this one.
            let mut active = active.lock().await;
            if active.get(&pair) == Some(&token) {
                active.remove(&pair);
            }
            debug!(%pair, ?exit, "runner finished");
        });
    }
}
