//! Ownership claims and the explicit context a worker carries for each one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pair::{PairKey, WorkerId};

/// Token minted on every successful claim. Distinguishes two incarnations
/// of the same worker id owning the same pair at different times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(pub Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Exclusive possession of a pair by one worker, as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipClaim {
    pub pair: PairKey,
    pub owner_id: WorkerId,
    pub claim_token: ClaimToken,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub input_queue: String,
    pub output_queue: String,
}

impl OwnershipClaim {
    /// Neither released nor past its lease.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.lease_expires_at > now
    }

    pub fn context(&self) -> ClaimContext {
        ClaimContext {
            pair: self.pair.clone(),
            worker_id: self.owner_id.clone(),
            claim_token: self.claim_token,
            input_queue: self.input_queue.clone(),
            output_queue: self.output_queue.clone(),
        }
    }
}

/// Outcome of `try_claim`.
#[derive(Debug, Clone)]
pub enum ClaimResult {
    Acquired(OwnershipClaim),
    /// Somebody else holds a live claim. The owner is for diagnostics only.
    AlreadyOwned { owner: WorkerId },
}

impl ClaimResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, ClaimResult::Acquired(_))
    }
}

/// Everything a worker needs to act on a pair it owns.
///
/// Passed explicitly into every per-pair operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimContext {
    pub pair: PairKey,
    pub worker_id: WorkerId,
    pub claim_token: ClaimToken,
    pub input_queue: String,
    pub output_queue: String,
}
