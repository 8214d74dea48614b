//! Response Emitter: deliver outcomes to requesters.
//!
//! Emission retries transient failures with backoff. The runner records
//! every response in the response log before emitting, and emits from a
//! spawned task so delivery never holds up the pair's state machine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ClaimContext, ResponseMessage};
use crate::resolver::strategy;
use crate::retry::{Backoff, with_backoff};
use crate::store::MessageQueue;

#[async_trait]
pub trait ResponseEmitter: Send + Sync {
    async fn emit(&self, ctx: &ClaimContext, response: &ResponseMessage) -> Result<()>;
}

/// Sends responses to the pair's output queue.
pub struct QueueEmitter {
    queue: Arc<dyn MessageQueue>,
    backoff: Backoff,
}

impl QueueEmitter {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            queue,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl ResponseEmitter for QueueEmitter {
    async fn emit(&self, ctx: &ClaimContext, response: &ResponseMessage) -> Result<()> {
        let payload = serde_json::to_value(response)?;
        let queue = self.queue.as_ref();
        let msg_id = with_backoff(&self.backoff, "emit_response", || {
            queue.send(&ctx.output_queue, &payload)
        })
        .await?;
        debug!(queue = %ctx.output_queue, msg_id, correlation_id = %response.correlation_id, "response queued");
        Ok(())
    }
}

/// What the webhook receives: the response plus the threading identifiers
/// the mail transport should put on the outgoing message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    project_id: &'a str,
    user_id: &'a str,
    message_id: String,
    body_marker: String,
    response: &'a ResponseMessage,
}

/// POSTs responses as JSON to a fixed URL.
pub struct WebhookEmitter {
    client: reqwest::Client,
    url: String,
    backoff: Backoff,
}

impl WebhookEmitter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<()> {
        let resp = self.client.post(&self.url).json(payload).send().await?;
        let status = resp.status();
        if status.is_client_error() {
            // The receiver rejected the payload; retrying will not help.
            return Err(Error::Other(format!("webhook rejected response: {status}")));
        }
        resp.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl ResponseEmitter for WebhookEmitter {
    async fn emit(&self, ctx: &ClaimContext, response: &ResponseMessage) -> Result<()> {
        let payload = WebhookPayload {
            project_id: &ctx.pair.project_id,
            user_id: &ctx.pair.user_id,
            message_id: strategy::message_id(response.thread_id),
            body_marker: strategy::body_marker(response.thread_id),
            response,
        };
        with_backoff(&self.backoff, "webhook", || self.post(&payload)).await?;
        debug!(url = %self.url, correlation_id = %response.correlation_id, "response posted");
        Ok(())
    }
}

/// Emits to every inner emitter, in order. All are attempted; the first
/// error is returned.
pub struct FanOut(pub Vec<Arc<dyn ResponseEmitter>>);

#[async_trait]
impl ResponseEmitter for FanOut {
    async fn emit(&self, ctx: &ClaimContext, response: &ResponseMessage) -> Result<()> {
        let mut first_err = None;
        for emitter in &self.0 {
            if let Err(e) = emitter.emit(ctx, response).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
