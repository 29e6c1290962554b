use std::path::PathBuf;

use thiserror::Error;

use crate::limits::Limits;
use crate::pipeline::{FailureKind, Stage};

/// Failure to obtain the source clip. Every variant maps to the same
/// user-facing outcome; the variants only matter for the operator log.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not resolve file handle {handle}: {reason}")]
    Resolve { handle: String, reason: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("reading body from {url} failed: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create work dir {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    CleanupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure anywhere between staging the input and reading the output back.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("failed to stage input at {path}: {source}")]
    WriteInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for engine: {0}")]
    Wait(#[source] std::io::Error),
    /// Engine stderr is kept for the operator log and must not reach the user.
    #[error("engine exited with code {}", code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    EngineFailed { code: Option<i32>, stderr: String },
    #[error("engine timed out after {secs}s and was killed")]
    TimedOut { secs: u64 },
    #[error("failed to read output at {path}: {source}")]
    ReadOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("engine produced an empty file at {path}")]
    EmptyOutput { path: PathBuf },
    #[error("transcode cancelled")]
    Cancelled,
}

/// Terminal failure of one conversion request
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("clip of {duration_secs}s / {size_bytes} bytes exceeds limits of {}", limits.describe())]
    TooLarge {
        duration_secs: u64,
        size_bytes: u64,
        limits: Limits,
    },
    #[error("fetch failed: {0}")]
    FetchFailed(FetchError),
    #[error("transcode failed: {0}")]
    TranscodeFailed(TranscodeError),
    #[error("cancelled while {stage}")]
    Cancelled { stage: Stage },
}

impl ConversionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConversionError::TooLarge { .. } => FailureKind::TooLarge,
            ConversionError::FetchFailed(_) => FailureKind::FetchFailed,
            ConversionError::TranscodeFailed(_) => FailureKind::TranscodeFailed,
            ConversionError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }
}

impl From<FetchError> for ConversionError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Cancelled => ConversionError::Cancelled {
                stage: Stage::Fetching,
            },
            other => ConversionError::FetchFailed(other),
        }
    }
}

impl From<TranscodeError> for ConversionError {
    fn from(error: TranscodeError) -> Self {
        match error {
            TranscodeError::Cancelled => ConversionError::Cancelled {
                stage: Stage::Transcoding,
            },
            other => ConversionError::TranscodeFailed(other),
        }
    }
}

impl From<WorkspaceError> for ConversionError {
    fn from(error: WorkspaceError) -> Self {
        ConversionError::TranscodeFailed(TranscodeError::Workspace(error))
    }
}
