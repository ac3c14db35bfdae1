use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Mounted camera identifiers, in the rig's canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CameraView {
    #[serde(rename = "CAM_FRONT")]
    Front,
    #[serde(rename = "CAM_FRONT_LEFT")]
    FrontLeft,
    #[serde(rename = "CAM_FRONT_RIGHT")]
    FrontRight,
    #[serde(rename = "CAM_BACK")]
    Back,
    #[serde(rename = "CAM_BACK_LEFT")]
    BackLeft,
    #[serde(rename = "CAM_BACK_RIGHT")]
    BackRight,
}

impl CameraView {
    pub const ALL: [CameraView; 6] = [
        CameraView::Front,
        CameraView::FrontLeft,
        CameraView::FrontRight,
        CameraView::Back,
        CameraView::BackLeft,
        CameraView::BackRight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CameraView::Front => "CAM_FRONT",
            CameraView::FrontLeft => "CAM_FRONT_LEFT",
            CameraView::FrontRight => "CAM_FRONT_RIGHT",
            CameraView::Back => "CAM_BACK",
            CameraView::BackLeft => "CAM_BACK_LEFT",
            CameraView::BackRight => "CAM_BACK_RIGHT",
        }
    }
}

impl fmt::Display for CameraView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraView {
    type Err = String;

    /// Accepts `CAM_FRONT`, `front`, `front-left`, and rig index aliases `cam0`..`cam5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        let name = normalized.strip_prefix("cam_").unwrap_or(&normalized);

        if let Some(index) = name.strip_prefix("cam").and_then(|n| n.parse::<usize>().ok()) {
            return Self::ALL
                .get(index)
                .copied()
                .ok_or_else(|| format!("Unknown camera index: {}", s));
        }

        match name {
            "front" => Ok(CameraView::Front),
            "front_left" => Ok(CameraView::FrontLeft),
            "front_right" => Ok(CameraView::FrontRight),
            "back" | "rear" => Ok(CameraView::Back),
            "back_left" | "rear_left" => Ok(CameraView::BackLeft),
            "back_right" | "rear_right" => Ok(CameraView::BackRight),
            _ => Err(format!("Unknown camera view: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Where an object sits relative to the ego vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Left,
    Right,
    Front,
    Rear,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Left => "left",
            Position::Right => "right",
            Position::Front => "front",
            Position::Rear => "rear",
        }
    }
}

/// Auxiliary qualitative descriptors (position, range, color, state...).
pub type Attributes = BTreeMap<String, String>;

/// One detected object instance in one camera view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in pixels.
    pub bbox: [i32; 4],
    pub pixel_center: Point,
    pub normalized_center: Point,
    pub camera_view: CameraView,
    pub position: Position,
    pub distance: f64,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub view: CameraView,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerceptionFlag {
    /// The detector ran but found nothing above the confidence floor.
    NoDetections,
    /// The detector failed; only the VLM description is available.
    DetectorUnavailable,
    /// Detections are present but VLM enrichment failed.
    VlmUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptionResult {
    pub detections: Vec<Detection>,
    pub description: String,
    pub vlm_context: Option<String>,
    pub frames: Vec<FrameInfo>,
    pub flags: Vec<PerceptionFlag>,
}

impl PerceptionResult {
    /// Flattened view used for text templating.
    pub fn objects(&self) -> Vec<ObjectSummary> {
        self.detections
            .iter()
            .map(|d| ObjectSummary {
                object: d.class.clone(),
                color: d.attributes.get("color").cloned().unwrap_or_default(),
                position: d
                    .attributes
                    .get("position")
                    .cloned()
                    .unwrap_or_else(|| d.position.as_str().to_string()),
            })
            .collect()
    }

    pub fn is_degraded(&self) -> bool {
        !self.flags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub object: String,
    pub color: String,
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    pub id: usize,
    pub detection: Detection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    LeftOf,
    RightOf,
    InFrontOf,
    Behind,
    Near,
    Far,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::LeftOf => "left_of",
            Relation::RightOf => "right_of",
            Relation::InFrontOf => "in_front_of",
            Relation::Behind => "behind",
            Relation::Near => "near",
            Relation::Far => "far",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "left_of" | "left" => Ok(Relation::LeftOf),
            "right_of" | "right" => Ok(Relation::RightOf),
            "in_front_of" | "front" | "ahead_of" => Ok(Relation::InFrontOf),
            "behind" | "back" => Ok(Relation::Behind),
            "near" | "close" | "next_to" => Ok(Relation::Near),
            "far" | "far_from" => Ok(Relation::Far),
            other => Err(format!("Unknown relation: {}", other)),
        }
    }
}

/// Directed spatial relation `source <relation> target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneEdge {
    pub source: usize,
    pub target: usize,
    pub relation: Relation,
    /// Raw geometric margin: pixels for directional/near edges, distance units for `far`.
    pub margin: f64,
    pub confidence: f32,
}

/// Objects and their pairwise relations for one question's camera input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneGraph {
    pub nodes: Vec<SceneNode>,
    pub edges: Vec<SceneEdge>,
    pub scene_description: String,
    pub raw_perception: PerceptionResult,
}

impl SceneGraph {
    pub fn node(&self, id: usize) -> Option<&SceneNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edges_of(&self, id: usize) -> impl Iterator<Item = &SceneEdge> {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn summary(&self) -> String {
        let mut summary = format!("Scene contains {} objects", self.nodes.len());
        if !self.nodes.is_empty() {
            let classes: Vec<&str> = self
                .nodes
                .iter()
                .map(|n| n.detection.class.as_str())
                .collect();
            summary.push_str(": ");
            summary.push_str(&classes.join(", "));
        }
        summary.push('.');

        if !self.edges.is_empty() {
            let relations: Vec<String> = self
                .edges
                .iter()
                .take(3)
                .map(|e| format!("obj_{} {} obj_{}", e.source, e.relation, e.target))
                .collect();
            summary.push_str(" Spatial relations: ");
            summary.push_str(&relations.join("; "));
            summary.push('.');
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_view_aliases() {
        assert_eq!("CAM_FRONT".parse::<CameraView>().unwrap(), CameraView::Front);
        assert_eq!("front-left".parse::<CameraView>().unwrap(), CameraView::FrontLeft);
        assert_eq!("cam0".parse::<CameraView>().unwrap(), CameraView::Front);
        assert_eq!("cam3".parse::<CameraView>().unwrap(), CameraView::Back);
        assert!("cam9".parse::<CameraView>().is_err());
        assert!("roof".parse::<CameraView>().is_err());
    }

    #[test]
    fn test_camera_view_serializes_as_rig_name() {
        let json = serde_json::to_string(&CameraView::BackRight).unwrap();
        assert_eq!(json, "\"CAM_BACK_RIGHT\"");
    }

    #[test]
    fn test_relation_parse() {
        assert_eq!("left of".parse::<Relation>().unwrap(), Relation::LeftOf);
        assert_eq!("in_front_of".parse::<Relation>().unwrap(), Relation::InFrontOf);
        assert!("under".parse::<Relation>().is_err());
    }

    #[test]
    fn test_detection_without_attributes_deserializes_to_empty_map() {
        let json = serde_json::json!({
            "class": "car",
            "confidence": 0.9,
            "bbox": [0, 0, 10, 10],
            "pixel_center": {"x": 5.0, "y": 5.0},
            "normalized_center": {"x": 0.5, "y": 0.5},
            "camera_view": "CAM_FRONT",
            "position": "front",
            "distance": 12.0
        });
        let detection: Detection = serde_json::from_value(json).unwrap();
        assert!(detection.attributes.is_empty());
    }
}
