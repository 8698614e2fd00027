//! Crate-wide error type
//!
//! One enum per recoverable failure class. Handlers map these onto the HTTP
//! envelope; internal best-effort paths (indexing, enrichment) log and drop
//! them instead of propagating.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistError {
    /// Malformed caller input; nothing was mutated.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A create collided with an existing document. Carries the surviving ID
    /// so callers can point at it.
    #[error("duplicate of existing knowledge {existing_id}")]
    Duplicate { existing_id: String },

    /// Best-effort parse failed (Markdown, JSONL line, front matter).
    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    /// Concurrent sync saw conflicting versions; newer `updatedAt` wins.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AssistError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable code for the HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Duplicate { .. } => "duplicate",
            Self::Parse(_) => "parse_error",
            Self::Io { .. } => "io_error",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream_error",
            Self::Conflict(_) => "conflict",
            Self::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, AssistError>;
