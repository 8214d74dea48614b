//! Conversation threads and the inbound messages that resolve to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pair::PairKey;

/// Prefix of every continuity token issued by mailroom.
pub const TOKEN_PREFIX: &str = "mr-";

/// Newtype for thread IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub Uuid);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a continuity token (`mr-<uuid>`) back into a thread id.
    pub fn from_token(token: &str) -> Option<Self> {
        let raw = token.strip_prefix(TOKEN_PREFIX)?;
        Uuid::parse_str(raw).ok().map(Self)
    }

    /// The continuity token issued for this thread.
    pub fn token(&self) -> String {
        format!("{TOKEN_PREFIX}{}", self.0)
    }

    /// Git branch all work for this thread happens on.
    pub fn branch_name(&self) -> String {
        format!("thread-{}", self.0)
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One ongoing conversation, bound to a single pair and a single branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: ThreadId,
    /// Identity of the external party (sender address).
    pub origin_address: String,
    pub pair: PairKey,
    /// `thread-{threadId}`; never changes.
    pub branch_name: String,
    /// Normalized subject of the first message, used for heuristic matching.
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Thread {
    /// A brand-new thread for the given origin and pair.
    pub fn start(
        origin_address: impl Into<String>,
        pair: PairKey,
        subject: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let thread_id = ThreadId::new();
        Self {
            thread_id,
            origin_address: origin_address.into(),
            pair,
            branch_name: thread_id.branch_name(),
            subject: subject.into(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn continuity_token(&self) -> String {
        self.thread_id.token()
    }
}

/// An inbound message after transport parsing.
///
/// The transport layer supplies the pair and source location; mailroom only
/// interprets the continuity hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub message_id: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// Structured reply metadata (`In-Reply-To`).
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// Structured reply metadata (`References`), oldest first.
    #[serde(default)]
    pub references: Vec<String>,
    pub project_id: String,
    pub user_id: String,
    pub source_ref: String,
    /// The instruction text. Falls back to `body` when absent.
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.project_id, &self.user_id)
    }

    pub fn instruction_text(&self) -> &str {
        self.instruction.as_deref().unwrap_or(&self.body)
    }
}
