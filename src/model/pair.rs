//! Pair identity and the deterministic queue names derived from it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Shared queue of pairs awaiting an owner.
pub const UNCLAIMED_QUEUE: &str = "unclaimed";

/// Where undeliverable or malformed messages end up.
pub const DEAD_LETTER_QUEUE: &str = "dead_letter";

/// A (project, user) combination: the unit of exclusive ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub project_id: String,
    pub user_id: String,
}

impl PairKey {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Stable 16-hex-digit digest of the pair identity.
    ///
    /// Pair identities are arbitrary strings; the digest keeps queue names
    /// and workspace directories within pgmq's identifier rules.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.project_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.user_id.as_bytes());
        let full = hex::encode(hasher.finalize());
        full[..16].to_string()
    }

    /// Name of this pair's dedicated input queue.
    pub fn input_queue(&self) -> String {
        format!("pair_in_{}", self.digest())
    }

    /// Name of this pair's dedicated output queue.
    pub fn output_queue(&self) -> String {
        format!("pair_out_{}", self.digest())
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.user_id)
    }
}

/// Identifier of one worker process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id of the form `<prefix>-<8 hex>`.
    pub fn generate(prefix: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{prefix}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
