//! Structured events emitted by the worker on every pair lifecycle change.
//!
//! Consumers subscribe to the event stream to build dashboards,
//! alerting, or audit logs. Events are the runtime's voice;
//! pair-scoped logs are the runner's voice.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{CorrelationId, ErrorKind, PairKey, PairState, WorkerId};

/// A structured event emitted by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PairClaimed {
        pair: PairKey,
        worker_id: WorkerId,
    },
    StateTransition {
        pair: PairKey,
        from: PairState,
        to: PairState,
    },
    RequestCompleted {
        pair: PairKey,
        correlation_id: CorrelationId,
        success: bool,
        error_kind: Option<ErrorKind>,
    },
    PairReleased {
        pair: PairKey,
        worker_id: WorkerId,
    },
    LeaseLost {
        pair: PairKey,
        worker_id: WorkerId,
    },
}

/// Cloneable publishing side of the event stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub fn emit(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
