//! Worker runtime: claim pairs, run their pipelines, give them back.

pub mod control;
pub mod event;
pub mod hooks;
mod lease;
mod pair;
pub mod steps;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use crate::deploy::DeploymentSink;
use crate::model::WorkerId;
use crate::respond::ResponseEmitter;
use crate::retry::Backoff;
use crate::store::{MessageQueue, OwnershipRegistry, ResponseLog};

pub use control::Worker;
pub use event::{Event, EventBus, EventKind};
pub use hooks::{HookBuilder, HookEditor, PipelineConfig};
pub use steps::{EditOutcome, Editor, SiteBuilder, Workspaces};
pub use workspace::GitWorkspaces;

/// Runtime knobs for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Claim lease; renewed every third of it.
    pub lease: Duration,
    /// Quiet time before a ready pair goes idle.
    pub idle_timeout: Duration,
    /// Quiet time in idle before the claim is released.
    pub release_timeout: Duration,
    /// Upper bound on any single pipeline step.
    pub step_timeout: Duration,
    /// Pairs this worker will own at once.
    pub max_pairs: usize,
    /// Fallback wake-up when no queue notification arrives.
    pub poll_interval: Duration,
    /// How long a read claim request stays hidden.
    pub claim_visibility: Duration,
    /// How long a read work message stays hidden. Should exceed the time a
    /// request can spend queued behind others plus its own pipeline.
    pub work_visibility: Duration,
    /// Reads of one claim request before its pair is given up on.
    pub max_claim_attempts: i32,
    /// Age after which an unclaimed pair is given up on.
    pub claim_window: Duration,
    /// Retry policy for registry, queue and response log calls.
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate("worker"),
            lease: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            release_timeout: Duration::from_secs(1800),
            step_timeout: Duration::from_secs(600),
            max_pairs: 4,
            poll_interval: Duration::from_secs(1),
            claim_visibility: Duration::from_secs(30),
            work_visibility: Duration::from_secs(900),
            max_claim_attempts: 5,
            claim_window: Duration::from_secs(3600),
            backoff: Backoff::default(),
        }
    }
}

/// The concrete steps a pair runner drives.
#[derive(Clone)]
pub struct Pipeline {
    pub workspaces: Arc<dyn Workspaces>,
    pub editor: Arc<dyn Editor>,
    pub builder: Arc<dyn SiteBuilder>,
    pub sink: Arc<dyn DeploymentSink>,
    pub emitter: Arc<dyn ResponseEmitter>,
}

/// The durable resources a worker talks to.
#[derive(Clone)]
pub struct Backends {
    pub registry: Arc<dyn OwnershipRegistry>,
    pub queue: Arc<dyn MessageQueue>,
    pub responses: Arc<dyn ResponseLog>,
}

impl Backends {
    /// All three roles played by one backend.
    pub fn from_one<B>(backend: Arc<B>) -> Self
    where
        B: OwnershipRegistry + MessageQueue + ResponseLog + 'static,
    {
        Self {
            registry: backend.clone(),
            queue: backend.clone(),
            responses: backend,
        }
    }
}

/// Everything shared between the control loop and its pair runners.
pub(crate) struct Runtime {
    pub backends: Backends,
    pub pipeline: Pipeline,
    pub config: WorkerConfig,
    pub events: EventBus,
}
