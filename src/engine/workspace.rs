//! Git-backed per-pair workspaces.
//!
//! One clone per pair under `<workspace_root>/<pair digest>`, one branch per
//! thread. Switching threads stashes the outgoing branch's uncommitted work
//! under a per-branch message and restores it when the branch comes back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::steps::Workspaces;
use crate::error::{Error, Result};
use crate::model::{ClaimContext, ErrorKind, PairKey};

const STASH_PREFIX: &str = "mailroom:";

#[derive(Debug, Clone)]
pub struct GitWorkspaces {
    root: PathBuf,
}

/// Run git in `dir`, returning trimmed stdout or the stderr as an error.
async fn git(dir: &Path, args: &[&str]) -> std::result::Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_AUTHOR_NAME", "mailroom")
        .env("GIT_AUTHOR_EMAIL", "mailroom@localhost")
        .env("GIT_COMMITTER_NAME", "mailroom")
        .env("GIT_COMMITTER_EMAIL", "mailroom@localhost")
        .output()
        .await
        .map_err(|e| format!("cannot run git: {e}"))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

async fn has_ref(dir: &Path, reference: &str) -> bool {
    git(dir, &["rev-parse", "--verify", "--quiet", reference])
        .await
        .is_ok()
}

async fn has_origin(dir: &Path) -> bool {
    git(dir, &["remote"])
        .await
        .is_ok_and(|remotes| remotes.lines().any(|r| r == "origin"))
}

async fn is_dirty(dir: &Path) -> Result<bool> {
    let status = git(dir, &["status", "--porcelain"])
        .await
        .map_err(Error::WorkspaceConflict)?;
    Ok(!status.is_empty())
}

/// The stash entry holding `branch`'s parked changes, if any.
async fn find_stash(dir: &Path, branch: &str) -> Result<Option<String>> {
    let list = git(dir, &["stash", "list", "--format=%gd %s"])
        .await
        .map_err(Error::WorkspaceConflict)?;
    let suffix = format!(": {STASH_PREFIX}{branch}");
    Ok(list
        .lines()
        .find(|line| line.ends_with(&suffix))
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string))
}

impl GitWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir_for(&self, pair: &PairKey) -> PathBuf {
        self.root.join(pair.digest())
    }

    async fn ensure_clone(&self, dir: &Path, source_ref: &str) -> Result<()> {
        if dir.join(".git").exists() {
            return Ok(());
        }
        if source_ref.trim().is_empty() {
            return Err(Error::WorkspaceConflict(format!(
                "no workspace at {} and no source to clone",
                dir.display()
            )));
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let target = dir.to_string_lossy();
        git(&self.root, &["clone", "--quiet", source_ref, &target])
            .await
            .map_err(Error::WorkspaceConflict)?;
        info!(source = source_ref, dir = %dir.display(), "workspace cloned");
        Ok(())
    }

    async fn switch_branch(&self, dir: &Path, branch: &str) -> Result<()> {
        let local = format!("refs/heads/{branch}");
        let remote = format!("refs/remotes/origin/{branch}");

        if has_ref(dir, &local).await {
            return git(dir, &["checkout", "--quiet", branch])
                .await
                .map(drop)
                .map_err(Error::WorkspaceConflict);
        }

        if has_origin(dir).await {
            if let Err(e) = git(dir, &["fetch", "--quiet", "origin"]).await {
                warn!(error = %e, "fetch failed, continuing with local refs");
            }
        }

        // Pushed history of this thread wins over a fresh branch.
        let args: Vec<String> = if has_ref(dir, &remote).await {
            vec!["checkout".into(), "--quiet".into(), "-b".into(), branch.into(), "--track".into(), format!("origin/{branch}")]
        } else if has_ref(dir, "refs/remotes/origin/HEAD").await {
            vec!["checkout".into(), "--quiet".into(), "-b".into(), branch.into(), "origin/HEAD".into()]
        } else {
            vec!["checkout".into(), "--quiet".into(), "-b".into(), branch.into()]
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        git(dir, &args)
            .await
            .map(drop)
            .map_err(Error::WorkspaceConflict)
    }
}

#[async_trait]
impl Workspaces for GitWorkspaces {
    async fn prepare(&self, ctx: &ClaimContext, source_ref: &str, branch: &str) -> Result<PathBuf> {
        let dir = self.dir_for(&ctx.pair);
        self.ensure_clone(&dir, source_ref).await?;

        let current = git(&dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map_err(Error::WorkspaceConflict)?;
        if current == branch {
            return Ok(dir);
        }

        if is_dirty(&dir).await? {
            let message = format!("{STASH_PREFIX}{current}");
            git(&dir, &["stash", "push", "--include-untracked", "-m", &message])
                .await
                .map_err(Error::WorkspaceConflict)?;
            debug!(branch = %current, "parked uncommitted changes");
        }

        self.switch_branch(&dir, branch).await?;

        if let Some(stash) = find_stash(&dir, branch).await? {
            git(&dir, &["stash", "pop", "--quiet", &stash])
                .await
                .map_err(Error::WorkspaceConflict)?;
            debug!(branch, "restored parked changes");
        }

        debug!(pair = %ctx.pair, from = %current, to = branch, "workspace switched");
        Ok(dir)
    }

    async fn commit(&self, ctx: &ClaimContext, workspace: &Path, branch: &str, message: &str) -> Result<()> {
        let fail = |e: String| Error::step(ErrorKind::CommitFailure, e);

        let current = git(workspace, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map_err(fail)?;
        if current != branch {
            return Err(fail(format!("workspace is on {current}, expected {branch}")));
        }

        git(workspace, &["add", "-A"]).await.map_err(fail)?;
        if is_dirty(workspace).await? {
            git(workspace, &["commit", "--quiet", "-m", message])
                .await
                .map_err(fail)?;
        } else {
            debug!(pair = %ctx.pair, branch, "nothing to commit");
        }

        if has_origin(workspace).await {
            git(workspace, &["push", "--quiet", "-u", "origin", branch])
                .await
                .map_err(fail)?;
        }
        info!(pair = %ctx.pair, branch, "changes committed");
        Ok(())
    }
}
