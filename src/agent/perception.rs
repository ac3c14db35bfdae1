use crate::config::PerceptionConfig;
use crate::detector::{ObjectDetector, RawDetection};
use crate::error::{PipelineError, Result};
use crate::frames::{encode_for_vlm, load_frame, CameraImage, Frame};
use crate::llm::{InferenceBackend, InferenceRequest};
use crate::types::{
    Attributes, CameraView, Detection, PerceptionFlag, PerceptionResult, Point, Position,
};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use super::prompts;

static OBJECT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[\s\-*]*obj_(\d+)\s*:\s*(.+)$").expect("object line regex"));

const VEHICLE_CLASSES: [&str; 4] = ["car", "truck", "bus", "motorcycle"];
const PEDESTRIAN_CLASSES: [&str; 2] = ["person", "pedestrian"];
const TRAFFIC_CLASSES: [&str; 2] = ["traffic light", "stop sign"];

/// Turns camera frames into uniform detection records plus a scene description.
pub struct Perception {
    backend: Arc<dyn InferenceBackend>,
    detector: Arc<dyn ObjectDetector>,
    vlm_model: String,
    config: PerceptionConfig,
}

impl Perception {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        detector: Arc<dyn ObjectDetector>,
        vlm_model: &str,
        config: PerceptionConfig,
    ) -> Self {
        Self {
            backend,
            detector,
            vlm_model: vlm_model.to_string(),
            config,
        }
    }

    pub async fn perceive(
        &self,
        images: &[CameraImage],
        question: &str,
        use_vlm: bool,
    ) -> Result<PerceptionResult> {
        let frames = images.iter().map(load_frame).collect::<Result<Vec<_>>>()?;
        self.perceive_frames(&frames, question, use_vlm).await
    }

    pub async fn perceive_frames(
        &self,
        frames: &[Frame],
        question: &str,
        use_vlm: bool,
    ) -> Result<PerceptionResult> {
        let mut detections = Vec::new();
        let mut detector_error = None;

        for frame in frames {
            match self.detector.detect(frame).await {
                Ok(raw) => {
                    debug!(view = %frame.view, count = raw.len(), "detector output");
                    detections.extend(
                        raw.into_iter()
                            .filter(|r| r.confidence >= self.config.min_confidence)
                            .map(|r| build_detection(r, frame, self.config.max_range)),
                    );
                }
                Err(e) => {
                    warn!(view = %frame.view, error = %e, "detector failed");
                    detector_error = Some(e);
                }
            }
        }

        let mut flags = Vec::new();
        if detections.is_empty() {
            if !use_vlm {
                let reason = match &detector_error {
                    Some(e) => format!("detector unavailable ({}) and VLM disabled", e),
                    None => "detector returned no detections and VLM disabled".to_string(),
                };
                return Err(PipelineError::Perception { reason });
            }
            flags.push(if detector_error.is_some() {
                PerceptionFlag::DetectorUnavailable
            } else {
                PerceptionFlag::NoDetections
            });
        } else if detector_error.is_some() {
            flags.push(PerceptionFlag::DetectorUnavailable);
        }

        let mut vlm_context = None;
        if use_vlm {
            match self.enrich(frames, question, &mut detections).await {
                Ok(context) => vlm_context = Some(context),
                Err(e) if detections.is_empty() => {
                    return Err(PipelineError::Perception {
                        reason: format!("no detections and VLM unavailable: {}", e),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "VLM enrichment failed, continuing with detections only");
                    flags.push(PerceptionFlag::VlmUnavailable);
                }
            }
        }

        let description = match (&vlm_context, detections.is_empty()) {
            (Some(context), true) => context.clone(),
            (Some(context), false) if !context.is_empty() => {
                format!("{} {}", describe_detections(&detections), context)
            }
            _ => describe_detections(&detections),
        };

        info!(
            detections = detections.len(),
            frames = frames.len(),
            degraded = !flags.is_empty(),
            "perception complete"
        );

        Ok(PerceptionResult {
            detections,
            description,
            vlm_context,
            frames: frames.iter().map(Frame::info).collect(),
            flags,
        })
    }

    /// One VLM call over all frames: merges per-object descriptors, returns scene context.
    async fn enrich(
        &self,
        frames: &[Frame],
        question: &str,
        detections: &mut [Detection],
    ) -> Result<String> {
        let images = frames
            .iter()
            .map(|f| {
                encode_for_vlm(&f.path, self.config.vlm_max_width, self.config.vlm_max_height)
                    .map(|e| e.base64)
            })
            .collect::<Result<Vec<_>>>()?;

        let prompt = prompts::perception_context_prompt(&format_detections(detections), question);
        let request = InferenceRequest::with_images(&self.vlm_model, prompt, images);
        let response = self.backend.generate(&request).await?;

        Ok(merge_descriptors(&response, detections))
    }
}

/// Build the uniform record: centers, ego-relative position, distance, base attributes.
pub fn build_detection(raw: RawDetection, frame: &Frame, max_range: f64) -> Detection {
    let [x1, y1, x2, y2] = raw.bbox;
    let width = frame.width.max(1) as f64;
    let height = frame.height.max(1) as f64;

    let pixel_center = Point::new(
        (x1 as f64 + x2 as f64) / 2.0,
        (y1 as f64 + y2 as f64) / 2.0,
    );
    let normalized_center = Point::new(pixel_center.x / width, pixel_center.y / height);

    let position = relative_position(frame.view, pixel_center.x, width);
    let bottom_ratio = (y2 as f64 / height).clamp(0.0, 1.0);
    let distance = max_range * (1.0 - bottom_ratio);

    let mut attributes = Attributes::new();
    attributes.insert("position".to_string(), position.as_str().to_string());
    attributes.insert("range".to_string(), range_label(bottom_ratio).to_string());

    Detection {
        class: raw.class,
        confidence: raw.confidence,
        bbox: raw.bbox,
        pixel_center,
        normalized_center,
        camera_view: frame.view,
        position,
        distance,
        attributes,
    }
}

/// Thirds of the image on front/back cameras; side cameras report their side.
fn relative_position(view: CameraView, x: f64, width: f64) -> Position {
    let third = if x < width * 0.33 {
        0
    } else if x < width * 0.66 {
        1
    } else {
        2
    };

    match view {
        CameraView::Front => [Position::Left, Position::Front, Position::Right][third],
        // The rear camera sees the ego's right side on its image left.
        CameraView::Back => [Position::Right, Position::Rear, Position::Left][third],
        CameraView::FrontLeft | CameraView::BackLeft => Position::Left,
        CameraView::FrontRight | CameraView::BackRight => Position::Right,
    }
}

fn range_label(bottom_ratio: f64) -> &'static str {
    if bottom_ratio > 0.8 {
        "close"
    } else if bottom_ratio > 0.5 {
        "medium"
    } else {
        "far"
    }
}

fn format_detections(detections: &[Detection]) -> String {
    if detections.is_empty() {
        return "No objects detected".to_string();
    }
    detections
        .iter()
        .enumerate()
        .map(|(i, d)| {
            format!(
                "- obj_{}: {} at {} ({}, {})",
                i,
                d.class,
                d.position.as_str(),
                d.attributes.get("range").map(String::as_str).unwrap_or("unknown"),
                d.camera_view
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse `obj_N: key=value, ...` lines into attributes; everything else is scene context.
/// Descriptors never overwrite geometry-derived attributes.
fn merge_descriptors(response: &str, detections: &mut [Detection]) -> String {
    let mut scene_lines = Vec::new();

    for line in response.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = OBJECT_LINE.captures(line) {
            let index: Option<usize> = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let Some(detection) = index.and_then(|i| detections.get_mut(i)) else {
                continue;
            };
            let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            for pair in body.split(',') {
                if let Some((key, value)) = pair.split_once('=') {
                    let key = key.trim().to_lowercase();
                    let value = value.trim().to_lowercase();
                    if key.is_empty() || value.is_empty() {
                        continue;
                    }
                    detection.attributes.entry(key).or_insert(value);
                }
            }
        } else if let Some(scene) = line.strip_prefix("SCENE:").or_else(|| line.strip_prefix("Scene:")) {
            scene_lines.push(scene.trim().to_string());
        } else {
            scene_lines.push(line.to_string());
        }
    }

    scene_lines.join(" ")
}

/// Natural-language summary grouped into vehicles, pedestrians and traffic elements.
pub fn describe_detections(detections: &[Detection]) -> String {
    if detections.is_empty() {
        return "No objects detected in the scene.".to_string();
    }

    let of = |classes: &[&str]| -> Vec<&Detection> {
        detections
            .iter()
            .filter(|d| classes.contains(&d.class.as_str()))
            .collect()
    };
    let vehicles = of(&VEHICLE_CLASSES);
    let pedestrians = of(&PEDESTRIAN_CLASSES);
    let traffic = of(&TRAFFIC_CLASSES);

    let range = |d: &Detection| d.attributes.get("range").cloned().unwrap_or_default();
    let mut parts = Vec::new();

    if !vehicles.is_empty() {
        let details: Vec<String> = vehicles
            .iter()
            .take(5)
            .map(|v| format!("{} at {} ({} distance)", v.class, v.position.as_str(), range(v)))
            .collect();
        parts.push(format!("Detected {} vehicle(s): {}", vehicles.len(), details.join(", ")));
    }

    if !pedestrians.is_empty() {
        let details: Vec<String> = pedestrians
            .iter()
            .take(3)
            .map(|p| format!("at {} ({} distance)", p.position.as_str(), range(p)))
            .collect();
        parts.push(format!(
            "Detected {} pedestrian(s): {}",
            pedestrians.len(),
            details.join(", ")
        ));
    }

    if !traffic.is_empty() {
        let details: Vec<String> = traffic
            .iter()
            .map(|t| format!("{} at {}", t.class, t.position.as_str()))
            .collect();
        parts.push(format!("Traffic elements: {}", details.join(", ")));
    }

    if parts.is_empty() {
        let details: Vec<String> = detections
            .iter()
            .take(5)
            .map(|d| format!("{} at {}", d.class, d.position.as_str()))
            .collect();
        parts.push(format!("Detected {} object(s): {}", detections.len(), details.join(", ")));
    }

    parts.join(". ") + "."
}
