use crate::agent::prompts;
use crate::config::PerceptionConfig;
use crate::error::{PipelineError, Result};
use crate::frames::{encode_for_vlm, Frame};
use crate::llm::{InferenceBackend, InferenceRequest};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static DETECTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[\s\-*\d.]*([a-z][a-z _]*?)\s*\|\s*([01](?:\.\d+)?)\s*\|\s*\[?\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*\]?",
    )
    .expect("detection line regex")
});

/// Detector output for one object: label, score, pixel box `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(rename = "class")]
    pub class: String,
    pub confidence: f32,
    pub bbox: [i32; 4],
}

#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

/// Asks the vision model to enumerate boxes on a downsized frame.
pub struct VlmDetector {
    backend: Arc<dyn InferenceBackend>,
    model: String,
    max_width: u32,
    max_height: u32,
}

impl VlmDetector {
    pub fn new(backend: Arc<dyn InferenceBackend>, model: &str, config: &PerceptionConfig) -> Self {
        Self {
            backend,
            model: model.to_string(),
            max_width: config.vlm_max_width,
            max_height: config.vlm_max_height,
        }
    }
}

#[async_trait]
impl ObjectDetector for VlmDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let encoded = encode_for_vlm(&frame.path, self.max_width, self.max_height)?;
        let enc_width = (frame.width as f64 / encoded.scale_x).round() as u32;
        let enc_height = (frame.height as f64 / encoded.scale_y).round() as u32;

        let request = InferenceRequest::with_images(
            &self.model,
            prompts::detection_prompt(enc_width, enc_height),
            vec![encoded.base64],
        );
        let response = self.backend.generate(&request).await?;
        debug!(view = %frame.view, chars = response.len(), "detector response");

        Ok(parse_detections(&response)
            .into_iter()
            .map(|d| scale_detection(d, encoded.scale_x, encoded.scale_y, frame))
            .collect())
    }
}

/// Reads precomputed detections from `<image>.detections.json` next to each frame.
pub struct SidecarDetector;

impl SidecarDetector {
    pub fn sidecar_path(frame: &Frame) -> PathBuf {
        let mut name = frame.path.as_os_str().to_owned();
        name.push(".detections.json");
        PathBuf::from(name)
    }
}

#[async_trait]
impl ObjectDetector for SidecarDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let path = Self::sidecar_path(frame);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| PipelineError::Io {
                path: path.clone(),
                source,
            })?;
        let detections: Vec<RawDetection> =
            serde_json::from_str(&text).map_err(|e| PipelineError::Perception {
                reason: format!("Invalid detections in {}: {}", path.display(), e),
            })?;
        let total = detections.len();
        let kept: Vec<RawDetection> = detections
            .into_iter()
            .filter_map(|d| clamp_to_frame(d, frame))
            .collect();
        if kept.len() < total {
            warn!(path = %path.display(), dropped = total - kept.len(), "sidecar boxes outside the frame");
        }
        Ok(kept)
    }
}

/// Clip a box to the frame. Boxes with no area left are dropped.
fn clamp_to_frame(d: RawDetection, frame: &Frame) -> Option<RawDetection> {
    let max_x = i32::try_from(frame.width).unwrap_or(i32::MAX);
    let max_y = i32::try_from(frame.height).unwrap_or(i32::MAX);
    let [x1, y1, x2, y2] = d.bbox;
    let bbox = [
        x1.clamp(0, max_x),
        y1.clamp(0, max_y),
        x2.clamp(0, max_x),
        y2.clamp(0, max_y),
    ];
    if bbox[2] <= bbox[0] || bbox[3] <= bbox[1] {
        return None;
    }
    Some(RawDetection { bbox, ..d })
}

/// Parse `class | confidence | x1,y1,x2,y2` lines; anything else is ignored.
pub fn parse_detections(response: &str) -> Vec<RawDetection> {
    response
        .lines()
        .filter_map(|line| {
            let caps = DETECTION_LINE.captures(line.trim())?;
            let class = caps.get(1)?.as_str().trim().to_lowercase();
            let confidence: f32 = caps.get(2)?.as_str().parse().ok()?;
            let coords: Vec<i32> = (3..=6)
                .filter_map(|i| caps.get(i)?.as_str().parse().ok())
                .collect();
            let [x1, y1, x2, y2] = <[i32; 4]>::try_from(coords).ok()?;
            if x2 <= x1 || y2 <= y1 {
                return None;
            }
            Some(RawDetection {
                class,
                confidence: confidence.clamp(0.0, 1.0),
                bbox: [x1, y1, x2, y2],
            })
        })
        .collect()
}

fn scale_detection(d: RawDetection, scale_x: f64, scale_y: f64, frame: &Frame) -> RawDetection {
    let max_x = frame.width as i32;
    let max_y = frame.height as i32;
    let sx = |v: i32| ((v as f64 * scale_x).round() as i32).clamp(0, max_x);
    let sy = |v: i32| ((v as f64 * scale_y).round() as i32).clamp(0, max_y);
    RawDetection {
        bbox: [sx(d.bbox[0]), sy(d.bbox[1]), sx(d.bbox[2]), sy(d.bbox[3])],
        ..d
    }
}
