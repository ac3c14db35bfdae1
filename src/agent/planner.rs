use crate::config::{ExecutorConfig, PlannerConfig};
use crate::error::{PipelineError, Result};
use crate::llm::{extract_json, InferenceBackend, InferenceRequest};
use crate::types::{CameraView, Point, Relation, SceneGraph};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::prompts;
use super::steps::{CoordinateTag, Plan, PlanMethod, PlanStep, StepAction, TagResolution};
use super::vocabulary::{class_matches, mentions_class, normalize_class};

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"<\s*(?:([A-Za-z][A-Za-z0-9_]*)\s*,\s*)?([A-Za-z][A-Za-z0-9_]*)\s*,\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*>",
    )
    .expect("coordinate tag regex")
});

static COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:how many|number of|count(?: the| all)?)\s+([a-z][a-z ]*?)(?:\s+(?:are|is|in|on|at|to|can|visible|there|near|around|do|does|ahead|behind)\b|[?.,!]|$)",
    )
    .expect("count regex")
});

static SAFETY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:safe|safety|danger|dangerous|hazard|hazards|risk|risky|collision|collide|brake|braking|yield|caution)\b")
        .expect("safety regex")
});

static PREDICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:will|going to|predict|next|intend|intention|likely|about to|future|behavior|behaviour)\b")
        .expect("predict regex")
});

const RELATION_PHRASES: [(&str, Relation); 9] = [
    ("to the left of", Relation::LeftOf),
    ("left of", Relation::LeftOf),
    ("to the right of", Relation::RightOf),
    ("right of", Relation::RightOf),
    ("in front of", Relation::InFrontOf),
    ("ahead of", Relation::InFrontOf),
    ("behind", Relation::Behind),
    ("far from", Relation::Far),
    ("close to", Relation::Near),
];

const ATTRIBUTE_KEYWORDS: [(&str, &str); 10] = [
    ("color", "color"),
    ("colour", "color"),
    ("moving", "state"),
    ("parked", "state"),
    ("stopped", "state"),
    ("status", "state"),
    ("how far", "range"),
    ("where", "position"),
    ("position", "position"),
    ("located", "position"),
];

/// Parameters `check_safety` steps are emitted with.
#[derive(Debug, Clone)]
pub struct SafetyRule {
    pub classes: Vec<String>,
    pub max_distance: f64,
}

impl From<&ExecutorConfig> for SafetyRule {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            classes: config.hazard_classes.clone(),
            max_distance: config.hazard_distance,
        }
    }
}

pub struct Planner {
    backend: Arc<dyn InferenceBackend>,
    llm_model: String,
    config: PlannerConfig,
    safety: SafetyRule,
}

impl Planner {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        llm_model: &str,
        config: PlannerConfig,
        safety: SafetyRule,
    ) -> Self {
        Self {
            backend,
            llm_model: llm_model.to_string(),
            config,
            safety,
        }
    }

    /// Parse the question into an ordered, validated plan.
    ///
    /// Only an empty or unparseable question is an error; everything else degrades to
    /// `answer_direct`.
    pub async fn plan(&self, question: &str, graph: &SceneGraph) -> Result<Plan> {
        let tags = parse_tags(question);
        let (text, tag_offsets) = strip_tags(question);

        if question.trim().is_empty() {
            return Err(PipelineError::Planning {
                reason: "question is empty".to_string(),
            });
        }
        if tags.is_empty() && !text.chars().any(char::is_alphanumeric) {
            return Err(PipelineError::Planning {
                reason: format!("question has no parseable content: {:?}", question),
            });
        }

        let resolutions: Vec<TagResolution> = tags
            .into_iter()
            .map(|tag| self.resolve_tag(tag, graph))
            .collect();
        let refs: Vec<TagRef> = resolutions
            .iter()
            .zip(tag_offsets)
            .map(|(r, offset)| TagRef {
                offset,
                node: r.node,
            })
            .collect();
        let resolved = refs.iter().filter(|r| r.node.is_some()).count();

        let mut method = PlanMethod::Rules;
        let mut steps = synthesize(&text, &refs, graph, &self.safety);

        if steps.is_empty() && self.config.use_llm {
            match self.plan_with_llm(question, graph).await {
                Ok(llm_steps) if !llm_steps.is_empty() => {
                    method = PlanMethod::Llm;
                    steps = llm_steps;
                }
                Ok(_) => debug!("LLM plan contained no usable steps"),
                Err(e) => warn!(error = %e, "LLM planning failed, answering directly"),
            }
        }

        if steps.is_empty() {
            method = PlanMethod::Fallback;
            let reason = if resolutions.iter().any(|r| r.node.is_none()) {
                "referenced object could not be resolved"
            } else {
                "question needs no structured reasoning"
            };
            steps.push(PlanStep::answer_direct(reason));
        }

        let steps = validate_steps(steps, graph);
        let reasoning = narrate(&resolutions, &steps, graph);

        info!(
            steps = steps.len(),
            method = ?method,
            tags = resolutions.len(),
            resolved,
            "plan ready"
        );

        Ok(Plan {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            steps,
            reasoning,
            resolutions,
            method,
        })
    }

    /// Nearest node in the tagged camera, in normalized space, below the match threshold.
    pub fn resolve_tag(&self, tag: CoordinateTag, graph: &SceneGraph) -> TagResolution {
        let nearest = nearest_node(&tag, graph, self.config.match_threshold);
        match nearest {
            Some((node, distance)) => debug!(tag = %tag.raw, node, distance, "tag resolved"),
            None => debug!(tag = %tag.raw, "tag did not resolve"),
        }
        TagResolution {
            node: nearest.map(|(n, _)| n),
            distance: nearest.map(|(_, d)| d),
            tag,
        }
    }

    async fn plan_with_llm(&self, question: &str, graph: &SceneGraph) -> Result<Vec<PlanStep>> {
        let prompt = prompts::planning_prompt(question, &graph.summary());
        let request = InferenceRequest::text(&self.llm_model, prompt).temperature(0.1);
        let response = self.backend.generate(&request).await?;
        debug!(response = %response.chars().take(200).collect::<String>(), "LLM plan response");
        Ok(parse_llm_steps(&response))
    }
}

/// All `<[label,]camera,x,y>` tags in order of appearance.
pub fn parse_tags(question: &str) -> Vec<CoordinateTag> {
    TAG.captures_iter(question)
        .filter_map(|caps| {
            let x: f64 = caps.get(3)?.as_str().parse().ok()?;
            let y: f64 = caps.get(4)?.as_str().parse().ok()?;
            Some(CoordinateTag {
                raw: caps.get(0)?.as_str().to_string(),
                label: caps.get(1).map(|m| m.as_str().to_string()),
                camera: caps.get(2)?.as_str().to_string(),
                point: Point::new(x, y),
            })
        })
        .collect()
}

fn nearest_node(tag: &CoordinateTag, graph: &SceneGraph, threshold: f64) -> Option<(usize, f64)> {
    let view: CameraView = tag.camera.parse().ok()?;

    let in_unit_square = |v: f64| (0.0..=1.0).contains(&v);
    if !in_unit_square(tag.point.x) || !in_unit_square(tag.point.y) {
        warn!(tag = %tag.raw, "tag coordinates are not normalized, refusing to match");
        return None;
    }

    graph
        .nodes
        .iter()
        .filter(|n| n.detection.camera_view == view)
        .map(|n| (n.id, n.detection.normalized_center.distance_to(&tag.point)))
        .filter(|(_, d)| *d < threshold)
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// A tag's byte offset in the stripped question text and the node it resolved to.
#[derive(Debug, Clone, Copy)]
struct TagRef {
    offset: usize,
    node: Option<usize>,
}

/// Lowercased question with tags blanked out, plus where each tag sat in that text.
fn strip_tags(question: &str) -> (String, Vec<usize>) {
    let mut text = String::with_capacity(question.len());
    let mut offsets = Vec::new();
    let mut last = 0;
    for m in TAG.find_iter(question) {
        text.push_str(&question[last..m.start()].to_lowercase());
        offsets.push(text.len());
        text.push(' ');
        last = m.end();
    }
    text.push_str(&question[last..].to_lowercase());
    (text, offsets)
}

/// Relation named in the question and the byte offset of the phrase naming it.
fn detect_relation(text: &str) -> Option<(Relation, usize)> {
    let phrase = RELATION_PHRASES
        .iter()
        .filter_map(|(phrase, relation)| text.find(phrase).map(|at| (*relation, at)))
        .min_by_key(|(_, at)| *at);
    if phrase.is_some() {
        return phrase;
    }
    let word_at = |word: &str| {
        text.match_indices(word).map(|(at, _)| at).find(|&at| {
            let before = text[..at].chars().next_back();
            let after = text[at + word.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
    };
    word_at("near")
        .or_else(|| text.find("next to"))
        .map(|at| (Relation::Near, at))
}

fn detect_attribute(text: &str) -> Option<&'static str> {
    ATTRIBUTE_KEYWORDS
        .iter()
        .find(|(keyword, _)| text.contains(keyword))
        .map(|(_, key)| *key)
}

/// First class present in the graph that the question talks about.
fn mentioned_class(text: &str, graph: &SceneGraph) -> Option<String> {
    graph
        .nodes
        .iter()
        .map(|n| n.detection.class.as_str())
        .find(|class| mentions_class(text, class))
        .map(normalize_class)
}

/// Keyword rules from question intent to steps, in evaluation order.
///
/// Any tag that failed to resolve disables every node-referencing step: the question is about
/// an object the scene graph does not contain.
fn synthesize(text: &str, refs: &[TagRef], graph: &SceneGraph, safety: &SafetyRule) -> Vec<PlanStep> {
    let mut steps = Vec::new();
    let class = mentioned_class(text, graph);
    let unresolved_reference = refs.iter().any(|r| r.node.is_none());
    let first_tagged = refs.iter().find_map(|r| r.node);
    let subject = first_tagged.or_else(|| {
        class.as_ref().and_then(|c| {
            graph
                .nodes
                .iter()
                .find(|n| class_matches(&n.detection.class, c))
                .map(|n| n.id)
        })
    });

    if let Some(caps) = COUNT.captures(text) {
        let counted = caps.get(1).map(|m| normalize_class(m.as_str())).unwrap_or_default();
        if !counted.is_empty() {
            steps.push(PlanStep::new(
                StepAction::CountObjects {
                    class: counted.clone(),
                },
                format!("Count {} nodes in the scene graph", counted),
            ));
        }
    }

    if let Some((relation, relation_at)) = detect_relation(text).filter(|_| !unresolved_reference) {
        let action = match refs {
            [first, second, ..] => Some(StepAction::CheckSpatial {
                relation: Some(relation),
                source: first.node,
                target: second.node,
                class: None,
            }),
            // A lone tag is the subject when it precedes the relation phrase.
            [only] if only.offset < relation_at => Some(StepAction::CheckSpatial {
                relation: Some(relation),
                source: only.node,
                target: None,
                class: class.clone(),
            }),
            [only] => Some(StepAction::CheckSpatial {
                relation: Some(relation),
                source: None,
                target: only.node,
                class: class.clone(),
            }),
            [] => class.clone().map(|c| StepAction::CheckSpatial {
                relation: Some(relation),
                source: None,
                target: None,
                class: Some(c),
            }),
        };
        if let Some(action) = action {
            steps.push(PlanStep::new(action, format!("Look up {} relations", relation)));
        }
    }

    if SAFETY.is_match(text) {
        steps.push(PlanStep::new(
            StepAction::CheckSafety {
                classes: safety.classes.clone(),
                max_distance: safety.max_distance,
            },
            "Check vulnerable road users close to the ego vehicle",
        ));
    }

    let wants_prediction = PREDICT.is_match(text);
    if let Some(node) = subject.filter(|_| !unresolved_reference) {
        if let Some(key) = detect_attribute(text) {
            steps.push(PlanStep::new(
                StepAction::GetAttribute {
                    node,
                    key: key.to_string(),
                },
                format!("Read {} of obj_{}", key, node),
            ));
        }
        if wants_prediction {
            steps.push(PlanStep::new(
                StepAction::PredictBehavior { node },
                format!("Predict what obj_{} does next", node),
            ));
        }
        if steps.is_empty() && first_tagged.is_some() {
            steps.push(PlanStep::new(
                StepAction::GetAttribute {
                    node,
                    key: "position".to_string(),
                },
                format!("Describe where obj_{} is", node),
            ));
        }
    }

    if unresolved_reference && !steps.is_empty() {
        steps.push(PlanStep::answer_direct("referenced object could not be resolved"));
    }

    steps
}

/// Replace any step whose references do not exist in the graph with `answer_direct`.
fn validate_steps(steps: Vec<PlanStep>, graph: &SceneGraph) -> Vec<PlanStep> {
    let mut validated: Vec<PlanStep> = Vec::with_capacity(steps.len());

    for step in steps {
        let step = match check_references(&step.action, graph) {
            Ok(()) => step,
            Err(reason) => {
                debug!(step = %step.action.describe(), %reason, "step substituted");
                PlanStep::answer_direct(reason)
            }
        };

        let duplicate_direct = matches!(step.action, StepAction::AnswerDirect { .. })
            && validated
                .iter()
                .any(|s| matches!(s.action, StepAction::AnswerDirect { .. }));
        if !duplicate_direct {
            validated.push(step);
        }
    }

    validated
}

fn check_references(action: &StepAction, graph: &SceneGraph) -> std::result::Result<(), String> {
    for id in action.referenced_nodes() {
        if graph.node(id).is_none() {
            return Err(format!("obj_{} does not exist in the scene", id));
        }
    }
    match action {
        StepAction::GetAttribute { node, key } => {
            let has_key = graph
                .node(*node)
                .map(|n| {
                    n.detection.attributes.contains_key(key)
                        || matches!(key.as_str(), "class" | "distance" | "camera")
                })
                .unwrap_or(false);
            if has_key {
                Ok(())
            } else {
                Err(format!("attribute '{}' is not known for obj_{}", key, node))
            }
        }
        StepAction::CountObjects { class } if class.trim().is_empty() => {
            Err("count step names no class".to_string())
        }
        _ => Ok(()),
    }
}

/// Build steps from an LLM JSON array; unknown kinds and malformed entries are skipped.
pub fn parse_llm_steps(response: &str) -> Vec<PlanStep> {
    let Some(json) = extract_json(response) else {
        return vec![];
    };
    let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(json) else {
        return vec![];
    };

    items
        .iter()
        .filter_map(|item| {
            let kind = item.get("kind").and_then(|v| v.as_str())?;
            let params = item.get("parameters").cloned().unwrap_or_default();
            let rationale = item
                .get("rationale")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let str_param = |name: &str| params.get(name).and_then(|v| v.as_str()).map(str::to_string);
            let id_param = |name: &str| params.get(name).and_then(|v| v.as_u64()).map(|v| v as usize);

            let action = match kind {
                "count_objects" => StepAction::CountObjects {
                    class: normalize_class(&str_param("class")?),
                },
                "check_spatial" => StepAction::CheckSpatial {
                    relation: str_param("relation").and_then(|r| r.parse().ok()),
                    source: id_param("source"),
                    target: id_param("target"),
                    class: str_param("class").map(|c| normalize_class(&c)),
                },
                "get_attribute" => StepAction::GetAttribute {
                    node: id_param("node")?,
                    key: str_param("key")?.to_lowercase(),
                },
                "check_safety" => StepAction::CheckSafety {
                    classes: params
                        .get("classes")
                        .and_then(|v| v.as_array())
                        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default(),
                    max_distance: params.get("max_distance").and_then(|v| v.as_f64()).unwrap_or(10.0),
                },
                "predict_behavior" => StepAction::PredictBehavior {
                    node: id_param("node")?,
                },
                "answer_direct" => StepAction::AnswerDirect {
                    reason: str_param("reason").unwrap_or_else(|| "planner chose a direct answer".to_string()),
                },
                _ => return None,
            };
            Some(PlanStep::new(action, rationale))
        })
        .collect()
}

fn narrate(resolutions: &[TagResolution], steps: &[PlanStep], graph: &SceneGraph) -> String {
    let mut lines = Vec::new();
    for r in resolutions {
        match (r.node.and_then(|id| graph.node(id)), r.distance) {
            (Some(node), Some(distance)) => lines.push(format!(
                "Resolved {} to obj_{} ({}, distance {:.3}).",
                r.tag.raw, node.id, node.detection.class, distance
            )),
            _ => lines.push(format!("Could not resolve {} to any detected object.", r.tag.raw)),
        }
    }
    for (i, step) in steps.iter().enumerate() {
        lines.push(format!("Step {}: {} - {}", i + 1, step.action.describe(), step.rationale));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::scene_graph::SceneGraphBuilder;
    use crate::agent::steps::StepKind;
    use crate::config::SceneGraphConfig;
    use crate::test_support::{detection_at, perception_of, FakeBackend};

    fn scene() -> SceneGraph {
        SceneGraphBuilder::new(SceneGraphConfig::default()).build(perception_of(vec![
            detection_at("pedestrian", CameraView::Front, 100.0, 100.0, 8.0),
            detection_at("car", CameraView::Front, 500.0, 100.0, 20.0),
        ]))
    }

    fn planner(backend: Arc<FakeBackend>, use_llm: bool) -> Planner {
        Planner::new(
            backend,
            "llm",
            PlannerConfig {
                use_llm,
                ..PlannerConfig::default()
            },
            SafetyRule::from(&ExecutorConfig::default()),
        )
    }

    fn rules_planner() -> Planner {
        planner(Arc::new(FakeBackend::unavailable()), false)
    }

    fn kinds(plan: &Plan) -> Vec<StepKind> {
        plan.steps.iter().map(|s| s.kind()).collect()
    }

    #[test]
    fn test_parse_tags_both_forms() {
        let tags = parse_tags("Is <c1,CAM_BACK,0.5073,0.5778> behind <cam0,0.12,0.2>?");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].label.as_deref(), Some("c1"));
        assert_eq!(tags[0].camera, "CAM_BACK");
        assert_eq!(tags[1].label, None);
        assert_eq!(tags[1].camera, "cam0");
        assert_eq!(tags[1].point, Point::new(0.12, 0.2));
    }

    #[test]
    fn test_resolution_within_threshold() {
        let graph = scene();
        let tag = parse_tags("<cam0,0.12,0.2>").remove(0);
        let resolution = rules_planner().resolve_tag(tag, &graph);
        assert_eq!(resolution.node, Some(0));
        assert!((resolution.distance.unwrap() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_resolution_misses_far_tag() {
        let graph = scene();
        let tag = parse_tags("<CAM_FRONT,0.9,0.9>").remove(0);
        assert_eq!(rules_planner().resolve_tag(tag, &graph).node, None);
    }

    #[test]
    fn test_resolution_requires_same_camera() {
        let graph = scene();
        let tag = parse_tags("<CAM_BACK,0.1,0.2>").remove(0);
        assert_eq!(rules_planner().resolve_tag(tag, &graph).node, None);
    }

    #[test]
    fn test_pixel_tag_is_never_matched() {
        let graph = scene();
        let tag = parse_tags("<cam0,100,100>").remove(0);
        assert_eq!(rules_planner().resolve_tag(tag, &graph).node, None);
    }

    #[tokio::test]
    async fn test_count_plan() {
        let plan = rules_planner()
            .plan("how many pedestrians are there", &scene())
            .await
            .unwrap();
        assert_eq!(plan.method, PlanMethod::Rules);
        assert_eq!(
            plan.steps[0].action,
            StepAction::CountObjects {
                class: "pedestrian".into()
            }
        );
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_tag_defaults_to_position_lookup() {
        let plan = rules_planner()
            .plan("What is the position of <cam0,0.12,0.2>?", &scene())
            .await
            .unwrap();
        assert_eq!(
            plan.steps,
            vec![PlanStep::new(
                StepAction::GetAttribute {
                    node: 0,
                    key: "position".into()
                },
                "Read position of obj_0"
            )]
        );
        assert!(plan.reasoning.contains("obj_0"));
    }

    #[tokio::test]
    async fn test_unresolved_tag_falls_back_to_answer_direct() {
        let plan = rules_planner()
            .plan("What is <cam0,0.9,0.9> going to do?", &scene())
            .await
            .unwrap();
        assert_eq!(kinds(&plan), vec![StepKind::AnswerDirect]);
        assert_eq!(plan.method, PlanMethod::Fallback);
        assert!(plan.has_unresolved_tags());
    }

    #[tokio::test]
    async fn test_missing_attribute_is_substituted() {
        let plan = rules_planner()
            .plan("What color is <cam0,0.1,0.2>?", &scene())
            .await
            .unwrap();
        assert_eq!(kinds(&plan), vec![StepKind::AnswerDirect]);
    }

    #[tokio::test]
    async fn test_spatial_between_two_tags() {
        let plan = rules_planner()
            .plan("Is <cam0,0.1,0.2> to the left of <cam0,0.5,0.2>?", &scene())
            .await
            .unwrap();
        assert_eq!(
            plan.steps[0].action,
            StepAction::CheckSpatial {
                relation: Some(Relation::LeftOf),
                source: Some(0),
                target: Some(1),
                class: None,
            }
        );
    }

    #[tokio::test]
    async fn test_partially_resolved_tags_answer_directly() {
        for question in [
            "Is <cam0,0.9,0.9> to the left of <cam0,0.5,0.2>?",
            "Is <cam0,0.1,0.2> to the left of <cam0,0.9,0.9>?",
        ] {
            let plan = rules_planner().plan(question, &scene()).await.unwrap();
            assert_eq!(kinds(&plan), vec![StepKind::AnswerDirect], "{}", question);
            assert_eq!(plan.method, PlanMethod::Fallback);
            assert!(plan.has_unresolved_tags());
        }
    }

    #[tokio::test]
    async fn test_lone_tag_keeps_its_side_of_the_relation() {
        let plan = rules_planner()
            .plan("Is <cam0,0.1,0.2> to the left of the car?", &scene())
            .await
            .unwrap();
        assert_eq!(
            plan.steps[0].action,
            StepAction::CheckSpatial {
                relation: Some(Relation::LeftOf),
                source: Some(0),
                target: None,
                class: Some("car".into()),
            }
        );

        let plan = rules_planner()
            .plan("Is the car to the right of <cam0,0.1,0.2>?", &scene())
            .await
            .unwrap();
        assert_eq!(
            plan.steps[0].action,
            StepAction::CheckSpatial {
                relation: Some(Relation::RightOf),
                source: None,
                target: Some(0),
                class: Some("car".into()),
            }
        );
    }

    #[test]
    fn test_strip_tags_records_offsets() {
        let (text, offsets) = strip_tags("Is <cam0,0.1,0.2> LEFT of <c1,CAM_FRONT,0.5,0.2>?");
        assert_eq!(text, "is   left of  ?");
        assert_eq!(offsets, vec![3, 13]);
    }

    #[tokio::test]
    async fn test_safety_and_prediction_stack() {
        let plan = rules_planner()
            .plan("Is it safe to go, and what will the car do next?", &scene())
            .await
            .unwrap();
        assert_eq!(kinds(&plan), vec![StepKind::CheckSafety, StepKind::PredictBehavior]);
        assert_eq!(plan.steps[1].action, StepAction::PredictBehavior { node: 1 });
    }

    #[tokio::test]
    async fn test_empty_question_is_planning_error() {
        let err = rules_planner().plan("   ", &scene()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Planning { .. }));
        let err = rules_planner().plan("?!", &scene()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Planning { .. }));
    }

    #[tokio::test]
    async fn test_llm_plan_is_validated() {
        let backend = Arc::new(FakeBackend::new(
            r#"Plan: [{"kind": "predict_behavior", "parameters": {"node": 7}, "rationale": "x"},
                      {"kind": "count_objects", "parameters": {"class": "cars"}, "rationale": "y"},
                      {"kind": "teleport", "parameters": {}}]"#,
        ));
        let plan = planner(backend.clone(), true)
            .plan("Describe the scene", &scene())
            .await
            .unwrap();
        assert_eq!(backend.calls(), 1);
        assert_eq!(plan.method, PlanMethod::Llm);
        assert_eq!(kinds(&plan), vec![StepKind::AnswerDirect, StepKind::CountObjects]);
    }

    #[tokio::test]
    async fn test_llm_failure_degrades() {
        let plan = planner(Arc::new(FakeBackend::unavailable()), true)
            .plan("Describe the scene", &scene())
            .await
            .unwrap();
        assert_eq!(kinds(&plan), vec![StepKind::AnswerDirect]);
    }
}
