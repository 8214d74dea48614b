//! Dispatcher: resolve an inbound message's thread and enqueue its work.
//!
//! Work always goes to the pair's input queue, so per-pair FIFO is the
//! queue's order whether or not the pair is owned yet. An unowned pair also
//! gets a claim request on the shared unclaimed queue.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::*;
use crate::resolver::{Resolution, ThreadResolver};
use crate::retry::{Backoff, with_backoff};
use crate::store::{self, MessageQueue, OwnershipRegistry};
use crate::telemetry::metrics;

/// Where a work request was placed.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Sent to the live owner's input queue.
    Owned { owner: WorkerId, queue: String },
    /// Sent to the pair's input queue, with a claim request posted.
    Unclaimed { queue: String },
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub resolution: Resolution,
    pub request: WorkRequest,
    pub route: Route,
}

pub struct Dispatcher {
    resolver: ThreadResolver,
    registry: Arc<dyn OwnershipRegistry>,
    queue: Arc<dyn MessageQueue>,
    backoff: Backoff,
}

/// Create the queues shared by every component (idempotent).
pub async fn ensure_shared_queues(queue: &dyn MessageQueue) -> Result<()> {
    queue.create_queue(UNCLAIMED_QUEUE).await?;
    queue.create_queue(DEAD_LETTER_QUEUE).await?;
    Ok(())
}

/// Create a pair's input and output queues (idempotent).
pub async fn ensure_pair_queues(queue: &dyn MessageQueue, pair: &PairKey) -> Result<()> {
    queue.create_queue(&pair.input_queue()).await?;
    queue.create_queue(&pair.output_queue()).await?;
    Ok(())
}

/// Post a claim trigger for `pair` on the unclaimed queue.
pub async fn request_claim(
    queue: &dyn MessageQueue,
    pair: &PairKey,
    source_ref: &str,
) -> Result<i64> {
    let request = ClaimRequest::for_pair(pair, source_ref);
    queue
        .send(UNCLAIMED_QUEUE, &serde_json::to_value(&request)?)
        .await
}

fn validate(message: &InboundMessage) -> Result<()> {
    let missing = [
        ("projectId", message.project_id.trim()),
        ("userId", message.user_id.trim()),
        ("sender", message.sender.trim()),
        ("sourceRef", message.source_ref.trim()),
        ("instruction", message.instruction_text().trim()),
    ]
    .into_iter()
    .filter(|(_, value)| value.is_empty())
    .map(|(field, _)| field)
    .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MalformedMessage(format!(
            "missing {}",
            missing.join(", ")
        )))
    }
}

impl Dispatcher {
    pub fn new(
        resolver: ThreadResolver,
        registry: Arc<dyn OwnershipRegistry>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            resolver,
            registry,
            queue,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Dispatch a raw JSON message from the transport layer.
    ///
    /// Anything that does not parse or validate is dead-lettered and
    /// reported as `MalformedMessage`.
    pub async fn dispatch_raw(&self, raw: serde_json::Value) -> Result<DispatchOutcome> {
        let message: InboundMessage = match serde_json::from_value(raw.clone()) {
            Ok(m) => m,
            Err(e) => {
                let err = Error::MalformedMessage(e.to_string());
                self.reject(raw, &err).await?;
                return Err(err);
            }
        };
        self.dispatch(&message).await
    }

    /// Resolve the thread, build the work request, and route it.
    pub async fn dispatch(&self, message: &InboundMessage) -> Result<DispatchOutcome> {
        if let Err(err) = validate(message) {
            self.reject(serde_json::to_value(message)?, &err).await?;
            return Err(err);
        }

        let resolution = self.resolver.resolve(message).await?;
        let thread = &resolution.thread;
        let request = WorkRequest {
            correlation_id: CorrelationId::new(),
            thread_id: thread.thread_id,
            project_id: thread.pair.project_id.clone(),
            user_id: thread.pair.user_id.clone(),
            instruction: message.instruction_text().to_string(),
            source_ref: message.source_ref.clone(),
            received_at: message.received_at,
        };

        let route = match self.route(&request).await {
            Ok(route) => route,
            Err(e) if e.is_transient() => {
                // Retries exhausted: park the request rather than lose it.
                warn!(correlation_id = %request.correlation_id, error = %e, "routing failed, dead-lettering");
                metrics::dispatch().add(1, &[KeyValue::new("route", "dead_letter")]);
                store::dead_letter(
                    self.queue.as_ref(),
                    "inbound",
                    format!("routing failed: {e}"),
                    serde_json::to_value(&request)?,
                )
                .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        info!(
            correlation_id = %request.correlation_id,
            thread_id = %request.thread_id,
            pair = %thread.pair,
            created_thread = resolution.created(),
            ?route,
            "work dispatched"
        );

        Ok(DispatchOutcome {
            resolution,
            request,
            route,
        })
    }

    async fn route(&self, request: &WorkRequest) -> Result<Route> {
        let pair = request.pair();
        let payload = serde_json::to_value(request)?;
        let registry = self.registry.as_ref();
        let queue = self.queue.as_ref();

        let claim = with_backoff(&self.backoff, "current_claim", || registry.current_claim(&pair)).await?;

        if let Some(claim) = claim {
            with_backoff(&self.backoff, "send_work", || queue.send(&claim.input_queue, &payload)).await?;

            // The owner may have released between the lookup and the send.
            // It re-posts a claim if it sees pending work after releasing,
            // this covers the other interleaving.
            let still_owned =
                with_backoff(&self.backoff, "current_claim", || registry.current_claim(&pair)).await?;
            if still_owned.is_none() {
                with_backoff(&self.backoff, "request_claim", || {
                    request_claim(queue, &pair, &request.source_ref)
                })
                .await?;
            }

            metrics::dispatch().add(1, &[KeyValue::new("route", "owned")]);
            return Ok(Route::Owned {
                owner: claim.owner_id,
                queue: claim.input_queue,
            });
        }

        let input = pair.input_queue();
        with_backoff(&self.backoff, "create_queues", || ensure_pair_queues(queue, &pair)).await?;
        with_backoff(&self.backoff, "send_work", || queue.send(&input, &payload)).await?;
        with_backoff(&self.backoff, "request_claim", || {
            request_claim(queue, &pair, &request.source_ref)
        })
        .await?;

        metrics::dispatch().add(1, &[KeyValue::new("route", "unclaimed")]);
        Ok(Route::Unclaimed { queue: input })
    }

    async fn reject(&self, payload: serde_json::Value, err: &Error) -> Result<()> {
        warn!(error = %err, "rejecting inbound message");
        metrics::dispatch().add(1, &[KeyValue::new("route", "dead_letter")]);
        store::dead_letter(self.queue.as_ref(), "inbound", err.to_string(), payload).await?;
        Ok(())
    }
}
