//! Pipeline configuration, loadable from TOML with per-field defaults.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub backend: BackendConfig,
    pub perception: PerceptionConfig,
    pub scene_graph: SceneGraphConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub verifier: VerifierConfig,
}

impl PipelineConfig {
    /// Parse a TOML document; missing sections and fields keep their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }
}

/// Inference backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub vlm_model: String,
    pub llm_model: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    /// First retry delay; doubled on every further attempt.
    pub backoff_ms: u64,
    /// Upper bound on questions in flight, and on pooled connections.
    pub concurrency: usize,
    pub question_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            vlm_model: "llava:latest".to_string(),
            llm_model: "gpt-oss:20b".to_string(),
            timeout_secs: 60,
            max_attempts: 3,
            backoff_ms: 500,
            concurrency: 4,
            question_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Vlm,
    Sidecar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    /// VLM scene enrichment. Independent of `detector`: the `vlm` detector calls the
    /// model for boxes even when this is off.
    pub use_vlm: bool,
    pub min_confidence: f32,
    /// Distance assigned to an object whose box touches the top of the frame.
    pub max_range: f64,
    pub vlm_max_width: u32,
    pub vlm_max_height: u32,
    pub detector: DetectorKind,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            use_vlm: true,
            min_confidence: 0.3,
            max_range: 50.0,
            vlm_max_width: 1280,
            vlm_max_height: 720,
            detector: DetectorKind::Sidecar,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneGraphConfig {
    /// Center deltas below this (in pixels, on both axes) yield `near`.
    pub min_pixel_margin: f64,
    /// Distance gap above which `far` overrides any direction.
    pub distance_gap: f64,
}

impl Default for SceneGraphConfig {
    fn default() -> Self {
        Self {
            min_pixel_margin: 20.0,
            distance_gap: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Maximum normalized distance between a tag and a node center.
    pub match_threshold: f64,
    pub use_llm: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.1,
            use_llm: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub summarize_with_llm: bool,
    pub hazard_distance: f64,
    pub hazard_classes: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            summarize_with_llm: false,
            hazard_distance: 10.0,
            hazard_classes: ["pedestrian", "person", "bicycle", "cyclist", "motorcycle"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub step_weight: f64,
    pub check_weight: f64,
    pub retry_threshold: f64,
    pub max_retries: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            step_weight: 0.5,
            check_weight: 0.5,
            retry_threshold: 0.5,
            max_retries: 1,
        }
    }
}
