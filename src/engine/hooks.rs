//! Edit and build steps backed by external executables.
//!
//! The pipeline file names one command per step:
//!
//! ```toml
//! [pipeline]
//! edit = { command = "hooks/edit.sh" }
//! build = { command = "hooks/build.sh", output_dir = "dist" }
//! ```
//!
//! Hooks run inside the workspace with `MAILROOM_*` variables describing
//! the request. The editor reports back through `edit-out.json` in the
//! pair's scratch directory.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::steps::{EditOutcome, Editor, SiteBuilder};
use crate::error::{Error, Result};
use crate::model::{ClaimContext, ErrorKind, WorkRequest};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PipelineFile {
    pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub edit: HookConfig,
    pub build: BuildHookConfig,
}

/// A step hook: just a path to an executable.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    pub command: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildHookConfig {
    pub command: PathBuf,
    /// Artifact directory, relative to the workspace.
    pub output_dir: PathBuf,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pipeline config {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad pipeline config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str::<PipelineFile>(content).map(|f| f.pipeline)
    }

    pub fn editor(&self) -> HookEditor {
        HookEditor {
            command: self.edit.command.clone(),
        }
    }

    pub fn builder(&self) -> HookBuilder {
        HookBuilder {
            command: self.build.command.clone(),
            output_dir: self.build.output_dir.clone(),
        }
    }
}

/// Per-pair directory for hook inputs and outputs, beside the workspace so
/// nothing in it gets committed.
pub fn scratch_dir(workspace: &Path) -> PathBuf {
    let mut name = workspace.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".scratch");
    workspace.with_file_name(name)
}

struct Hook<'a> {
    step: &'static str,
    command: &'a Path,
    ctx: &'a ClaimContext,
    workspace: &'a Path,
    request: &'a WorkRequest,
}

impl Hook<'_> {
    /// Run the hook to completion. With `kill_on_cancel`, cancellation
    /// kills the process; otherwise the hook is allowed to finish and the
    /// cancellation is reported afterwards.
    async fn run(&self, cancel: &CancellationToken, kill_on_cancel: bool) -> Result<ExitStatus> {
        // Resolve relative command paths against the process CWD, not the
        // workspace the hook runs in.
        let command = if self.command.is_relative() {
            std::env::current_dir()?.join(self.command)
        } else {
            self.command.to_path_buf()
        };
        let scratch = scratch_dir(self.workspace);
        tokio::fs::create_dir_all(&scratch).await?;

        debug!(
            step = self.step,
            command = %command.display(),
            workspace = %self.workspace.display(),
            "running hook"
        );

        let mut child = Command::new(&command)
            .current_dir(self.workspace)
            .env("MAILROOM_STEP", self.step)
            .env("MAILROOM_WORKSPACE", self.workspace)
            .env("MAILROOM_SCRATCH_DIR", &scratch)
            .env("MAILROOM_PROJECT_ID", &self.ctx.pair.project_id)
            .env("MAILROOM_USER_ID", &self.ctx.pair.user_id)
            .env("MAILROOM_THREAD_ID", self.request.thread_id.0.to_string())
            .env("MAILROOM_BRANCH", self.request.branch_name())
            .env("MAILROOM_CORRELATION_ID", self.request.correlation_id.to_string())
            .env("MAILROOM_INSTRUCTION", &self.request.instruction)
            .kill_on_drop(true)
            .spawn()?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled(), if kill_on_cancel => {
                warn!(step = self.step, "cancelling hook");
                child.kill().await?;
                return Err(Error::Cancelled);
            }
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(status)
    }
}

fn check_status(kind: ErrorKind, step: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::step(
            kind,
            format!("{step} hook exited with status {}", status.code().unwrap_or(-1)),
        ))
    }
}

/// Runs the configured edit hook. The process is never killed mid-edit,
/// so a cancelled edit still leaves a consistent workspace.
#[derive(Debug, Clone)]
pub struct HookEditor {
    command: PathBuf,
}

#[async_trait]
impl Editor for HookEditor {
    async fn edit(
        &self,
        ctx: &ClaimContext,
        workspace: &Path,
        request: &WorkRequest,
        cancel: &CancellationToken,
    ) -> Result<EditOutcome> {
        let out_path = scratch_dir(workspace).join("edit-out.json");
        match tokio::fs::remove_file(&out_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let hook = Hook {
            step: "edit",
            command: &self.command,
            ctx,
            workspace,
            request,
        };
        let status = hook.run(cancel, false).await?;
        check_status(ErrorKind::EditFailure, "edit", status)?;

        let content = tokio::fs::read_to_string(&out_path).await.map_err(|e| {
            Error::step(ErrorKind::EditFailure, format!("missing edit-out.json: {e}"))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::step(ErrorKind::EditFailure, format!("bad edit-out.json: {e}")))
    }
}

/// Runs the configured build hook and returns its output directory.
#[derive(Debug, Clone)]
pub struct HookBuilder {
    command: PathBuf,
    output_dir: PathBuf,
}

#[async_trait]
impl SiteBuilder for HookBuilder {
    async fn build(
        &self,
        ctx: &ClaimContext,
        workspace: &Path,
        request: &WorkRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let hook = Hook {
            step: "build",
            command: &self.command,
            ctx,
            workspace,
            request,
        };
        let status = hook.run(cancel, true).await?;
        check_status(ErrorKind::BuildFailure, "build", status)?;

        let artifact = workspace.join(&self.output_dir);
        if !tokio::fs::metadata(&artifact).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::step(
                ErrorKind::BuildFailure,
                format!("build produced no {}", self.output_dir.display()),
            ));
        }
        Ok(artifact)
    }
}
