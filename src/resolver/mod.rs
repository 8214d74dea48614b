//! Thread Resolver: map an inbound message to a persistent thread.
//!
//! Strategies run in order and the first confident match wins. When nothing
//! matches, or the heuristic is ambiguous, a new thread is created: a
//! duplicate thread is recoverable, a wrongly merged one is not.

pub mod strategy;

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{InboundMessage, Thread};
use crate::store::ThreadStore;
use strategy::{BodyMarker, Confidence, ContinuityStrategy, Heuristic, Match, ReplyHeaders};

/// Heuristic matching knobs.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// How far back a thread's last activity may be for a heuristic match.
    pub heuristic_window: Duration,
    /// Minimum subject similarity for a heuristic candidate.
    pub similarity_threshold: f64,
    /// Runner-up within this margin of the best candidate means ambiguous.
    pub ambiguity_margin: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            heuristic_window: Duration::days(7),
            similarity_threshold: 0.6,
            ambiguity_margin: 0.05,
        }
    }
}

/// The outcome of resolving one message.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub thread: Thread,
    /// `None` when the thread was created for this message.
    pub confidence: Option<Confidence>,
}

impl Resolution {
    pub fn created(&self) -> bool {
        self.confidence.is_none()
    }
}

pub struct ThreadResolver {
    store: Arc<dyn ThreadStore>,
    strategies: Vec<Box<dyn ContinuityStrategy>>,
}

impl ThreadResolver {
    /// Resolver with the standard chain: headers, body marker, heuristic.
    pub fn new(store: Arc<dyn ThreadStore>, config: ResolverConfig) -> Self {
        Self::with_strategies(
            store,
            vec![
                Box::new(ReplyHeaders),
                Box::new(BodyMarker),
                Box::new(Heuristic {
                    window: config.heuristic_window,
                    threshold: config.similarity_threshold,
                    margin: config.ambiguity_margin,
                }),
            ],
        )
    }

    pub fn with_strategies(
        store: Arc<dyn ThreadStore>,
        strategies: Vec<Box<dyn ContinuityStrategy>>,
    ) -> Self {
        Self { store, strategies }
    }

    /// Return the message's thread, creating and persisting one if needed.
    pub async fn resolve(&self, message: &InboundMessage) -> Result<Resolution> {
        for strategy in &self.strategies {
            match strategy.find(message, self.store.as_ref()).await? {
                Match::Found { thread, confidence } => {
                    let mut thread = *thread;
                    if thread.pair != message.pair() {
                        warn!(
                            thread_id = %thread.thread_id,
                            thread_pair = %thread.pair,
                            message_pair = %message.pair(),
                            "message resolved to a thread of another pair, thread pair wins"
                        );
                    }
                    self.store
                        .touch(thread.thread_id, message.received_at)
                        .await?;
                    thread.last_activity_at = thread.last_activity_at.max(message.received_at);
                    debug!(
                        thread_id = %thread.thread_id,
                        strategy = strategy.name(),
                        ?confidence,
                        "thread resolved"
                    );
                    return Ok(Resolution {
                        thread,
                        confidence: Some(confidence),
                    });
                }
                Match::Ambiguous { candidates } => {
                    info!(
                        strategy = strategy.name(),
                        candidates = candidates.len(),
                        "ambiguous thread match, starting a new thread"
                    );
                    break;
                }
                Match::NoMatch => {}
            }
        }

        let thread = Thread::start(
            &message.sender,
            message.pair(),
            strategy::normalize_subject(&message.subject),
            message.received_at,
        );
        self.store.insert_thread(&thread).await?;
        info!(
            thread_id = %thread.thread_id,
            pair = %thread.pair,
            branch = %thread.branch_name,
            "thread created"
        );
        Ok(Resolution {
            thread,
            confidence: None,
        })
    }
}
