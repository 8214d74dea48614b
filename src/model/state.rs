//! Per-pair worker state machine.

use serde::{Deserialize, Serialize};

/// Where a pair's pipeline currently stands on its owning worker.
///
/// Held in memory by the owner only; never persisted. After a crash the
/// next owner starts again from `Claimed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    /// Claim acquired, no request pulled yet.
    Claimed,
    /// Editing, or waiting for the next request after a failure.
    Processing,
    Building,
    Deploying,
    Committing,
    /// Last request finished; waiting for more.
    Ready,
    /// Quiet for a while but the claim is retained.
    Idle,
    /// Claim given back. Terminal.
    Released,
}

impl PairState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: PairState) -> bool {
        use PairState::*;
        matches!(
            (self, to),
            (Claimed, Processing)
                | (Processing, Building)
                | (Building, Deploying)
                | (Building, Processing)   // build failed or interrupted
                | (Deploying, Committing)
                | (Deploying, Processing)  // deploy failed or interrupted
                | (Committing, Ready)
                | (Committing, Processing) // commit failed
                | (Processing, Processing) // interrupt restarts from the newest request
                | (Ready, Processing)
                | (Ready, Idle)
                | (Processing, Idle)       // nothing pending after a failure
                | (Claimed, Idle)          // trigger arrived but no work followed
                | (Idle, Processing)
                | (Idle, Released)
        ) || (to == Released && self != Released) // lease lost or shutdown
    }

    /// States in which an in-flight step can be interrupted.
    pub fn is_interruptible(self) -> bool {
        matches!(
            self,
            PairState::Processing | PairState::Building | PairState::Deploying
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PairState::Released
    }
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PairState::Claimed => "claimed",
            PairState::Processing => "processing",
            PairState::Building => "building",
            PairState::Deploying => "deploying",
            PairState::Committing => "committing",
            PairState::Ready => "ready",
            PairState::Idle => "idle",
            PairState::Released => "released",
        };
        write!(f, "{s}")
    }
}
