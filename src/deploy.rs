//! Deployment Sink: publish a built artifact and name it.
//!
//! The reference is derived from the artifact's content, so publishing the
//! same tree twice yields the same reference and leaves the published
//! directory untouched.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::model::{ErrorKind, PairKey};

/// Marker file recording which digest a published directory holds.
const REV_FILE: &str = ".mailroom-rev";

/// A published artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRef {
    pub url: String,
    /// Hex SHA-256 of the artifact tree.
    pub digest: String,
}

impl DeploymentRef {
    /// The `deploymentRef` string carried in responses.
    pub fn to_wire(&self) -> String {
        format!("{}?rev={}", self.url, &self.digest[..12.min(self.digest.len())])
    }
}

impl std::fmt::Display for DeploymentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[async_trait]
pub trait DeploymentSink: Send + Sync {
    /// Publish the artifact directory for `pair`. Only ever called with a
    /// complete build output.
    async fn publish(&self, pair: &PairKey, artifact: &Path) -> Result<DeploymentRef>;
}

/// Hex SHA-256 over the sorted relative paths and contents of `root`.
pub fn artifact_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::step(ErrorKind::DeployFailure, e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Other(e.to_string()))?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        let mut file = fs::File::open(entry.path())?;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::step(ErrorKind::DeployFailure, e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::Other(e.to_string()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Publishes into `<publish_root>/<project_id>/`, served under
/// `<public_base_url>/<project_id>/`.
///
/// Every user of a project publishes to the same directory, so publishes
/// for one project are serialised. Clones share the locks; sinks in other
/// processes do not.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    publish_root: PathBuf,
    public_base_url: String,
    projects: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl DirectorySink {
    pub fn new(publish_root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            publish_root: publish_root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            projects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_project(&self, project_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .projects
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn url_for(&self, project_id: &str) -> String {
        format!("{}/{}/", self.public_base_url, project_id)
    }

    fn publish_blocking(&self, project_id: &str, artifact: &Path) -> Result<DeploymentRef> {
        if !artifact.is_dir() {
            return Err(Error::step(
                ErrorKind::DeployFailure,
                format!("artifact {} is not a directory", artifact.display()),
            ));
        }
        let digest = artifact_digest(artifact)?;
        let reference = DeploymentRef {
            url: self.url_for(project_id),
            digest: digest.clone(),
        };

        let target = self.publish_root.join(project_id);
        let current = fs::read_to_string(target.join(REV_FILE)).unwrap_or_default();
        if current.trim() == digest {
            debug!(project_id, %digest, "artifact already published");
            return Ok(reference);
        }

        // Stage next to the target so the swap is two renames on one filesystem.
        fs::create_dir_all(&self.publish_root)?;
        let staging = self
            .publish_root
            .join(format!(".staging-{}", Uuid::new_v4()));
        copy_tree(artifact, &staging)?;
        fs::write(staging.join(REV_FILE), &digest)?;

        let retired = self.publish_root.join(format!(".retired-{}", Uuid::new_v4()));
        if target.exists() {
            fs::rename(&target, &retired)?;
        }
        fs::rename(&staging, &target)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }

        info!(project_id, %digest, url = %reference.url, "artifact published");
        Ok(reference)
    }
}

fn plain_segment(project_id: &str) -> bool {
    let mut components = Path::new(project_id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[async_trait]
impl DeploymentSink for DirectorySink {
    async fn publish(&self, pair: &PairKey, artifact: &Path) -> Result<DeploymentRef> {
        if !plain_segment(&pair.project_id) {
            return Err(Error::step(
                ErrorKind::DeployFailure,
                format!("project id {:?} is not a plain path segment", pair.project_id),
            ));
        }
        let guard = self.lock_project(&pair.project_id).await;
        let sink = self.clone();
        let project_id = pair.project_id.clone();
        let artifact = artifact.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            sink.publish_blocking(&project_id, &artifact)
        })
        .await
        .map_err(|e| Error::Other(format!("publish task failed: {e}")))?
    }
}
