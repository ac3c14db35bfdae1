use crate::error::StepError;
use crate::types::{Point, Relation, SceneEdge};
use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// Steps - the closed reasoning vocabulary
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    CountObjects,
    CheckSpatial,
    GetAttribute,
    CheckSafety,
    PredictBehavior,
    AnswerDirect,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::CountObjects => "count_objects",
            StepKind::CheckSpatial => "check_spatial",
            StepKind::GetAttribute => "get_attribute",
            StepKind::CheckSafety => "check_safety",
            StepKind::PredictBehavior => "predict_behavior",
            StepKind::AnswerDirect => "answer_direct",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step kind together with its typed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "snake_case")]
pub enum StepAction {
    /// Count nodes whose class matches `class`.
    CountObjects { class: String },

    /// Find edges matching every filter that is set.
    CheckSpatial {
        relation: Option<Relation>,
        source: Option<usize>,
        target: Option<usize>,
        /// Class the non-fixed endpoint must have.
        class: Option<String>,
    },

    /// Read one attribute of one node.
    GetAttribute { node: usize, key: String },

    /// Any node of `classes` within `max_distance` of the ego vehicle.
    CheckSafety { classes: Vec<String>, max_distance: f64 },

    /// Short predictive statement for one node.
    PredictBehavior { node: usize },

    /// Answer from the perception summary alone.
    AnswerDirect { reason: String },
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            StepAction::CountObjects { .. } => StepKind::CountObjects,
            StepAction::CheckSpatial { .. } => StepKind::CheckSpatial,
            StepAction::GetAttribute { .. } => StepKind::GetAttribute,
            StepAction::CheckSafety { .. } => StepKind::CheckSafety,
            StepAction::PredictBehavior { .. } => StepKind::PredictBehavior,
            StepAction::AnswerDirect { .. } => StepKind::AnswerDirect,
        }
    }

    /// Node ids this step depends on.
    pub fn referenced_nodes(&self) -> Vec<usize> {
        match self {
            StepAction::CheckSpatial { source, target, .. } => {
                source.iter().chain(target.iter()).copied().collect()
            }
            StepAction::GetAttribute { node, .. } | StepAction::PredictBehavior { node } => vec![*node],
            _ => vec![],
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StepAction::CountObjects { class } => format!("count_objects({})", class),
            StepAction::CheckSpatial {
                relation,
                source,
                target,
                class,
            } => {
                let mut parts = Vec::new();
                if let Some(s) = source {
                    parts.push(format!("obj_{}", s));
                }
                if let Some(r) = relation {
                    parts.push(r.to_string());
                }
                if let Some(t) = target {
                    parts.push(format!("obj_{}", t));
                }
                if let Some(c) = class {
                    parts.push(c.clone());
                }
                format!("check_spatial({})", parts.join(", "))
            }
            StepAction::GetAttribute { node, key } => format!("get_attribute(obj_{}, {})", node, key),
            StepAction::CheckSafety { classes, max_distance } => {
                format!("check_safety({} within {})", classes.join("/"), max_distance)
            }
            StepAction::PredictBehavior { node } => format!("predict_behavior(obj_{})", node),
            StepAction::AnswerDirect { .. } => "answer_direct()".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(flatten)]
    pub action: StepAction,
    pub rationale: String,
}

impl PlanStep {
    pub fn new(action: StepAction, rationale: impl Into<String>) -> Self {
        Self {
            action,
            rationale: rationale.into(),
        }
    }

    pub fn answer_direct(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            rationale: format!("Answer from perception: {}", reason),
            action: StepAction::AnswerDirect { reason },
        }
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

// ==========================================
// Coordinate tags
// ==========================================

/// `<[label,]camera,x,y>` reference embedded in a question. Coordinates are normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateTag {
    pub raw: String,
    pub label: Option<String>,
    pub camera: String,
    pub point: Point,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagResolution {
    pub tag: CoordinateTag,
    pub node: Option<usize>,
    pub distance: Option<f64>,
}

// ==========================================
// Plan
// ==========================================

/// How the steps were synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMethod {
    Rules,
    Llm,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub question: String,
    pub steps: Vec<PlanStep>,
    pub reasoning: String,
    pub resolutions: Vec<TagResolution>,
    pub method: PlanMethod,
}

impl Plan {
    pub fn has_unresolved_tags(&self) -> bool {
        self.resolutions.iter().any(|r| r.node.is_none())
    }

    pub fn format(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {} - {}", i + 1, s.action.describe(), s.rationale))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ==========================================
// Step results
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutput {
    Count { count: usize },
    Spatial { holds: bool, edges: Vec<SceneEdge> },
    /// `value: None` is the not-found marker.
    Attribute {
        node: usize,
        key: String,
        value: Option<String>,
    },
    Safety { hazard: bool, node_ids: Vec<usize> },
    Text { text: String },
}

impl StepOutput {
    pub fn render(&self) -> String {
        match self {
            StepOutput::Count { count } => count.to_string(),
            StepOutput::Spatial { holds, edges } => {
                if *holds {
                    let relations: Vec<String> = edges
                        .iter()
                        .map(|e| format!("obj_{} {} obj_{}", e.source, e.relation, e.target))
                        .collect();
                    format!("Yes ({})", relations.join(", "))
                } else {
                    "No".to_string()
                }
            }
            StepOutput::Attribute { value, .. } => {
                value.clone().unwrap_or_else(|| "unknown".to_string())
            }
            StepOutput::Safety { hazard, node_ids } => {
                if *hazard {
                    let ids: Vec<String> = node_ids.iter().map(|id| format!("obj_{}", id)).collect();
                    format!("Caution: hazard near the ego vehicle ({})", ids.join(", "))
                } else {
                    "Safe to proceed with caution".to_string()
                }
            }
            StepOutput::Text { text } => text.clone(),
        }
    }
}

/// One entry of `step_results`. Exactly one of `output`/`error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub kind: StepKind,
    pub output: Option<StepOutput>,
    pub error: Option<StepError>,
}

impl StepRecord {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
