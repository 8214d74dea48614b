//! Work requests, responses, and the JSON messages that carry them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pair::PairKey;
use super::thread::ThreadId;

/// Newtype for correlation IDs (matches a response to its request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Work Request
// ---------------------------------------------------------------------------

/// One unit of instruction to execute. Travels as the `WorkMessage` on a
/// pair's input queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub correlation_id: CorrelationId,
    pub thread_id: ThreadId,
    pub project_id: String,
    pub user_id: String,
    /// Opaque to mailroom; handed to the editor untouched.
    pub instruction: String,
    /// Repository the pair's workspace is cloned from.
    pub source_ref: String,
    pub received_at: DateTime<Utc>,
}

impl WorkRequest {
    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.project_id, &self.user_id)
    }

    pub fn branch_name(&self) -> String {
        self.thread_id.branch_name()
    }
}

/// The claim trigger placed on the shared unclaimed queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub project_id: String,
    pub user_id: String,
    pub source_ref: String,
    pub requested_at: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn for_pair(pair: &PairKey, source_ref: impl Into<String>) -> Self {
        Self {
            project_id: pair.project_id.clone(),
            user_id: pair.user_id.clone(),
            source_ref: source_ref.into(),
            requested_at: Utc::now(),
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.project_id, &self.user_id)
    }
}

/// Wrapper for anything routed to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Queue the payload was taken from, or `inbound` for dispatch failures.
    pub source: String,
    pub reason: String,
    pub payload: serde_json::Value,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(source: impl Into<String>, reason: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
            payload,
            dead_lettered_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Why a work request did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ClaimConflict,
    MalformedMessage,
    WorkspaceConflict,
    EditFailure,
    BuildFailure,
    DeployFailure,
    CommitFailure,
    Superseded,
    LeaseLost,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ClaimConflict => "claim_conflict",
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::WorkspaceConflict => "workspace_conflict",
            ErrorKind::EditFailure => "edit_failure",
            ErrorKind::BuildFailure => "build_failure",
            ErrorKind::DeployFailure => "deploy_failure",
            ErrorKind::CommitFailure => "commit_failure",
            ErrorKind::Superseded => "superseded",
            ErrorKind::LeaseLost => "lease_lost",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of processing one work request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub correlation_id: CorrelationId,
    pub thread_id: ThreadId,
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub changed_artifacts: Vec<String>,
    pub deployment_ref: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl ResponseMessage {
    pub fn succeeded(
        request: &WorkRequest,
        summary: impl Into<String>,
        changed_artifacts: Vec<String>,
        deployment_ref: String,
    ) -> Self {
        Self {
            correlation_id: request.correlation_id,
            thread_id: request.thread_id,
            success: true,
            summary: summary.into(),
            changed_artifacts,
            deployment_ref: Some(deployment_ref),
            error_kind: None,
        }
    }

    pub fn failed(request: &WorkRequest, kind: ErrorKind, summary: impl Into<String>) -> Self {
        Self {
            correlation_id: request.correlation_id,
            thread_id: request.thread_id,
            success: false,
            summary: summary.into(),
            changed_artifacts: Vec::new(),
            deployment_ref: None,
            error_kind: Some(kind),
        }
    }

    pub fn superseded(request: &WorkRequest, by: CorrelationId) -> Self {
        Self::failed(
            request,
            ErrorKind::Superseded,
            format!("superseded by {by}"),
        )
    }
}
