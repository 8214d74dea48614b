//! Continuity strategies, tried in order by the resolver.
//!
//! Each strategy looks at one kind of evidence and reports how sure it is.
//! Structured reply headers are exact but often stripped by intermediate
//! mail systems; the body marker survives more relays; the heuristic is a
//! last resort and refuses to pick between near-equal candidates.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Duration;
use regex::Regex;

use crate::error::Result;
use crate::model::{InboundMessage, Thread, ThreadId};
use crate::store::ThreadStore;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"mr-[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}").expect("valid token regex"));

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[mailroom:(mr-[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\]")
        .expect("valid marker regex")
});

static REPLY_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*((re|fwd?|aw|sv)\s*(\[\d+\])?\s*:\s*)+").expect("valid prefix regex"));

/// How the thread was matched, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    /// Token in structured reply metadata.
    Exact,
    /// Token in the body marker.
    Embedded,
    /// Sender, recency and subject agree with exactly one thread.
    Heuristic,
}

/// What one strategy concluded.
#[derive(Debug, Clone)]
pub enum Match {
    Found {
        thread: Box<Thread>,
        confidence: Confidence,
    },
    /// Several equally plausible threads. Never merge on this.
    Ambiguous { candidates: Vec<ThreadId> },
    NoMatch,
}

#[async_trait]
pub trait ContinuityStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn find(&self, message: &InboundMessage, store: &dyn ThreadStore) -> Result<Match>;
}

/// The marker text to embed in outgoing bodies for a thread.
pub fn body_marker(thread_id: ThreadId) -> String {
    format!("[mailroom:{}]", thread_id.token())
}

/// The Message-ID to put on outgoing mail for a thread.
pub fn message_id(thread_id: ThreadId) -> String {
    format!("<{}@mailroom>", thread_id.token())
}

/// Subject with reply/forward prefixes removed and whitespace collapsed.
pub fn normalize_subject(subject: &str) -> String {
    let stripped = REPLY_PREFIX_RE.replace(subject, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn words(subject: &str) -> HashSet<String> {
    normalize_subject(subject)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard overlap of the two subjects' word sets, in `[0, 1]`.
pub fn subject_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (words(a), words(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count() as f64;
    let total = a.union(&b).count() as f64;
    shared / total
}

async fn lookup_tokens<'a>(
    tokens: impl Iterator<Item = &'a str>,
    store: &dyn ThreadStore,
    confidence: Confidence,
) -> Result<Match> {
    for token in tokens {
        if let Some(thread) = store.find_by_token(token).await? {
            return Ok(Match::Found {
                thread: Box::new(thread),
                confidence,
            });
        }
    }
    Ok(Match::NoMatch)
}

/// Tokens in `In-Reply-To`, then `References` newest first.
pub struct ReplyHeaders;

#[async_trait]
impl ContinuityStrategy for ReplyHeaders {
    fn name(&self) -> &'static str {
        "reply_headers"
    }

    async fn find(&self, message: &InboundMessage, store: &dyn ThreadStore) -> Result<Match> {
        let headers = message
            .in_reply_to
            .iter()
            .chain(message.references.iter().rev());
        let tokens: Vec<&str> = headers
            .flat_map(|h| TOKEN_RE.find_iter(h).map(|m| m.as_str()))
            .collect();
        lookup_tokens(tokens.into_iter(), store, Confidence::Exact).await
    }
}

/// `[mailroom:mr-<uuid>]` anywhere in the body, first occurrence wins.
pub struct BodyMarker;

#[async_trait]
impl ContinuityStrategy for BodyMarker {
    fn name(&self) -> &'static str {
        "body_marker"
    }

    async fn find(&self, message: &InboundMessage, store: &dyn ThreadStore) -> Result<Match> {
        let tokens: Vec<&str> = MARKER_RE
            .captures_iter(&message.body)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        lookup_tokens(tokens.into_iter(), store, Confidence::Embedded).await
    }
}

/// Same sender, same pair, recent activity, similar subject.
pub struct Heuristic {
    pub window: Duration,
    pub threshold: f64,
    /// A runner-up scoring within this margin of the best makes the result ambiguous.
    pub margin: f64,
}

#[async_trait]
impl ContinuityStrategy for Heuristic {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn find(&self, message: &InboundMessage, store: &dyn ThreadStore) -> Result<Match> {
        let since = message.received_at - self.window;
        let recent = store
            .recent_for_origin(&message.sender, &message.pair(), since)
            .await?;

        let mut scored: Vec<(f64, Thread)> = recent
            .into_iter()
            .map(|t| (subject_similarity(&message.subject, &t.subject), t))
            .filter(|(score, _)| *score >= self.threshold)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut ranked = scored.into_iter();
        let Some((best_score, best)) = ranked.next() else {
            return Ok(Match::NoMatch);
        };
        let rivals: Vec<ThreadId> = ranked
            .take_while(|(score, _)| best_score - score <= self.margin)
            .map(|(_, t)| t.thread_id)
            .collect();

        if rivals.is_empty() {
            Ok(Match::Found {
                thread: Box::new(best),
                confidence: Confidence::Heuristic,
            })
        } else {
            let mut candidates = vec![best.thread_id];
            candidates.extend(rivals);
            Ok(Match::Ambiguous { candidates })
        }
    }
}
