//! Error types for mailroom.

use crate::model::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Outstanding changes could not be committed or stashed before a
    /// branch switch. The workspace is left untouched.
    #[error("workspace conflict: {0}")]
    WorkspaceConflict(String),

    /// An external pipeline step (edit, build, deploy, commit) failed.
    #[error("{kind} failed: {message}")]
    Step { kind: ErrorKind, message: String },

    #[error("lease lost for {0}")]
    LeaseLost(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn step(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Step {
            kind,
            message: message.into(),
        }
    }

    /// Infrastructure failures that are worth retrying at the point of origin.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => !matches!(e, sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. }),
            Error::Io(_) | Error::Timeout(_) | Error::Http(_) => true,
            _ => false,
        }
    }

    /// The wire error kind reported back to the requester for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Step { kind, .. } => *kind,
            Error::MalformedMessage(_) | Error::Serialization(_) => ErrorKind::MalformedMessage,
            Error::WorkspaceConflict(_) => ErrorKind::WorkspaceConflict,
            Error::LeaseLost(_) => ErrorKind::LeaseLost,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Superseded,
            _ => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
