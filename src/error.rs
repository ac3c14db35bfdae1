use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Stage-fatal errors. Any of these aborts the current question only.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Perception failed: {reason}")]
    Perception { reason: String },

    #[error("Planning failed: {reason}")]
    Planning { reason: String },

    #[error("Inference backend unavailable after {attempts} attempt(s): {reason}")]
    BackendUnavailable { attempts: u32, reason: String },

    #[error("Inference backend returned an unusable response: {0}")]
    BackendResponse(String),

    #[error("Failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Question timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Perception { .. } => ErrorKind::Perception,
            PipelineError::Planning { .. } => ErrorKind::Planning,
            PipelineError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            PipelineError::BackendResponse(_) => ErrorKind::BackendResponse,
            PipelineError::Image { .. } | PipelineError::Io { .. } => ErrorKind::Input,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Flat label of a [`PipelineError`], reported to batch consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Perception,
    Planning,
    BackendUnavailable,
    BackendResponse,
    Input,
    Config,
    Timeout,
}

/// Failure of a single executor step. Recorded, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum StepError {
    #[error("node {id} does not exist in the scene graph")]
    UnknownNode { id: usize },

    #[error("scene graph has no nodes")]
    EmptyGraph,

    #[error("missing parameter: {name}")]
    MissingParameter { name: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
