//! Answers questions about driving camera scenes through an interpretable
//! perception, scene graph, planning, execution and verification pipeline.

pub mod agent;
pub mod config;
pub mod detector;
pub mod error;
pub mod frames;
pub mod llm;
pub mod types;

#[cfg(test)]
mod test_support;

pub use agent::{BatchItem, BatchOutcome, Pipeline, PipelineAnswer, QuestionOutcome};
pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, Result, StepError};
pub use frames::CameraImage;
pub use types::{CameraView, Detection, PerceptionResult, SceneEdge, SceneGraph, SceneNode};
