//! Core data model.
//!
//! A pair (project, user) is owned by at most one worker at a time. Threads
//! are conversations scoped to one pair; work requests belong to a thread and
//! are answered by exactly one response.

pub mod claim;
pub mod pair;
pub mod state;
pub mod thread;
pub mod work;

pub use claim::{ClaimContext, ClaimResult, ClaimToken, OwnershipClaim};
pub use pair::{DEAD_LETTER_QUEUE, PairKey, UNCLAIMED_QUEUE, WorkerId};
pub use state::PairState;
pub use thread::{InboundMessage, Thread, ThreadId};
pub use work::{
    ClaimRequest, CorrelationId, DeadLetter, ErrorKind, ResponseMessage, WorkRequest,
};
