//! # mailroom
//!
//! Claim-based routing of conversational work requests to a warm pool of
//! stateful workers.
//!
//! Inbound messages are resolved to persistent threads and dispatched to
//! per-(project, user) queues (pgmq). Exactly one worker owns a pair at a
//! time under a renewable lease; it runs each request through edit, build,
//! deploy and commit, and answers on the pair's output queue.

pub mod config;
pub mod db;
pub mod deploy;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod model;
pub mod resolver;
pub mod respond;
pub mod retry;
pub mod store;
pub mod telemetry;
