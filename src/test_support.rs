//! In-process fakes and fixtures shared by unit tests.

use crate::detector::{ObjectDetector, RawDetection};
use crate::error::{PipelineError, Result};
use crate::frames::Frame;
use crate::llm::{InferenceBackend, InferenceRequest};
use crate::types::{Attributes, CameraView, Detection, PerceptionResult, Point, Position};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const FRAME_WIDTH: f64 = 1000.0;
pub const FRAME_HEIGHT: f64 = 500.0;

/// Returns a canned response, or `BackendUnavailable` when built with `unavailable()`.
pub struct FakeBackend {
    response: Option<String>,
    calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(response: &str) -> Self {
        Self {
            response: Some(response.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            response: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    async fn generate(&self, _request: &InferenceRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response
            .clone()
            .ok_or_else(|| PipelineError::BackendUnavailable {
                attempts: 1,
                reason: "fake backend down".to_string(),
            })
    }
}

/// Emits the same detections for every frame.
pub struct FakeDetector {
    detections: Vec<RawDetection>,
}

impl FakeDetector {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self { detections }
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }
}

#[async_trait]
impl ObjectDetector for FakeDetector {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<RawDetection>> {
        Ok(self.detections.clone())
    }
}

pub fn raw(class: &str, bbox: [i32; 4]) -> RawDetection {
    RawDetection {
        class: class.to_string(),
        confidence: 0.9,
        bbox,
    }
}

pub fn frame(view: CameraView, width: u32, height: u32) -> Frame {
    Frame {
        view,
        path: PathBuf::from(format!("{}.png", view.as_str().to_lowercase())),
        width,
        height,
    }
}

pub fn frame_on_disk(dir: &Path, view: CameraView, width: u32, height: u32) -> Frame {
    let path = dir.join(format!("{}.png", view.as_str().to_lowercase()));
    image::RgbImage::new(width, height)
        .save(&path)
        .expect("write test frame");
    Frame {
        view,
        path,
        width,
        height,
    }
}

/// Detection centered at `(x, y)` on a 1000x500 frame.
pub fn detection_at(class: &str, view: CameraView, x: f64, y: f64, distance: f64) -> Detection {
    let position = if x < FRAME_WIDTH * 0.33 {
        Position::Left
    } else if x < FRAME_WIDTH * 0.66 {
        Position::Front
    } else {
        Position::Right
    };
    let mut attributes = Attributes::new();
    attributes.insert("position".to_string(), position.as_str().to_string());

    Detection {
        class: class.to_string(),
        confidence: 0.9,
        bbox: [x as i32 - 20, y as i32 - 20, x as i32 + 20, y as i32 + 20],
        pixel_center: Point::new(x, y),
        normalized_center: Point::new(x / FRAME_WIDTH, y / FRAME_HEIGHT),
        camera_view: view,
        position,
        distance,
        attributes,
    }
}

pub fn perception_of(detections: Vec<Detection>) -> PerceptionResult {
    PerceptionResult {
        description: crate::agent::perception::describe_detections(&detections),
        detections,
        vlm_context: None,
        frames: vec![],
        flags: vec![],
    }
}
