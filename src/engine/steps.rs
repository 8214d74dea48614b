//! The pipeline seams a pair runner drives.
//!
//! The runner owns sequencing, timeouts and cancellation; these traits only
//! do the work. Long-running implementations should watch the cancellation
//! token and return [`Error::Cancelled`](crate::error::Error::Cancelled)
//! promptly, leaving the workspace consistent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{ClaimContext, WorkRequest};

/// What the editor reports back. Also the shape of `edit-out.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub summary: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

/// Per-pair working copies of the source repository.
#[async_trait]
pub trait Workspaces: Send + Sync {
    /// Make sure the pair's workspace exists and has `branch` checked out.
    ///
    /// Switching away from another branch must preserve its uncommitted
    /// changes; failing to do so is a `WorkspaceConflict`.
    async fn prepare(&self, ctx: &ClaimContext, source_ref: &str, branch: &str) -> Result<PathBuf>;

    /// Commit everything in the workspace to `branch` and push it.
    async fn commit(&self, ctx: &ClaimContext, workspace: &Path, branch: &str, message: &str) -> Result<()>;
}

/// Applies an instruction to a workspace.
#[async_trait]
pub trait Editor: Send + Sync {
    async fn edit(
        &self,
        ctx: &ClaimContext,
        workspace: &Path,
        request: &WorkRequest,
        cancel: &CancellationToken,
    ) -> Result<EditOutcome>;
}

/// Turns a workspace into a deployable artifact directory.
#[async_trait]
pub trait SiteBuilder: Send + Sync {
    async fn build(
        &self,
        ctx: &ClaimContext,
        workspace: &Path,
        request: &WorkRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}
