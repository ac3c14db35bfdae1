use crate::config::ExecutorConfig;
use crate::error::StepError;
use crate::llm::{InferenceBackend, InferenceRequest};
use crate::types::{ObjectSummary, PerceptionResult, Relation, SceneGraph, SceneNode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::prompts;
use super::steps::{Plan, StepAction, StepOutput, StepRecord};
use super::vocabulary::class_matches;

/// State threaded through one plan execution. Later steps see earlier results.
pub struct ExecutionContext<'a> {
    pub scene_graph: &'a SceneGraph,
    pub perception: &'a PerceptionResult,
    pub objects: Vec<ObjectSummary>,
    pub step_results: Vec<StepRecord>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(scene_graph: &'a SceneGraph, perception: &'a PerceptionResult) -> Self {
        Self {
            scene_graph,
            perception,
            objects: perception.objects(),
            step_results: Vec::new(),
        }
    }

    fn node(&self, id: usize) -> Result<&'a SceneNode, StepError> {
        if self.scene_graph.nodes.is_empty() {
            return Err(StepError::EmptyGraph);
        }
        self.scene_graph.node(id).ok_or(StepError::UnknownNode { id })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub answer: String,
    pub reasoning: String,
    pub step_results: Vec<StepRecord>,
}

impl ExecutionResult {
    pub fn failed_steps(&self) -> usize {
        self.step_results.iter().filter(|r| !r.is_ok()).count()
    }
}

pub struct Executor {
    config: ExecutorConfig,
    summarizer: Option<(Arc<dyn InferenceBackend>, String)>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            summarizer: None,
        }
    }

    /// Enable the closing LLM summary (only used when `summarize_with_llm` is set).
    pub fn with_summarizer(mut self, backend: Arc<dyn InferenceBackend>, model: &str) -> Self {
        self.summarizer = Some((backend, model.to_string()));
        self
    }

    pub async fn execute(
        &self,
        plan: &Plan,
        scene_graph: &SceneGraph,
        perception: &PerceptionResult,
    ) -> ExecutionResult {
        let mut ctx = ExecutionContext::new(scene_graph, perception);

        for (index, step) in plan.steps.iter().enumerate() {
            let record = match run_step(&step.action, &ctx) {
                Ok(output) => {
                    debug!(step = index + 1, kind = %step.kind(), result = %output.render(), "step done");
                    StepRecord {
                        index,
                        kind: step.kind(),
                        output: Some(output),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(step = index + 1, kind = %step.kind(), error = %e, "step failed, continuing");
                    StepRecord {
                        index,
                        kind: step.kind(),
                        output: None,
                        error: Some(e),
                    }
                }
            };
            ctx.step_results.push(record);
        }

        let mut answer = compose_answer(&ctx.step_results);
        let reasoning = reasoning_chain(plan, &ctx.step_results);

        if self.config.summarize_with_llm {
            if let Some(summary) = self.summarize(&plan.question, &reasoning, &answer).await {
                answer = summary;
            }
        }

        info!(
            steps = ctx.step_results.len(),
            failed = ctx.step_results.iter().filter(|r| !r.is_ok()).count(),
            "execution finished"
        );

        ExecutionResult {
            answer,
            reasoning,
            step_results: ctx.step_results,
        }
    }

    async fn summarize(&self, question: &str, evidence: &str, draft: &str) -> Option<String> {
        let (backend, model) = self.summarizer.as_ref()?;
        let prompt = prompts::answer_summary_prompt(question, evidence, draft);
        match backend.generate(&InferenceRequest::text(model, prompt)).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "answer summary failed, keeping templated answer");
                None
            }
        }
    }
}

fn run_step(action: &StepAction, ctx: &ExecutionContext<'_>) -> Result<StepOutput, StepError> {
    match action {
        StepAction::CountObjects { class } => count_objects(class, ctx),
        StepAction::CheckSpatial {
            relation,
            source,
            target,
            class,
        } => check_spatial(*relation, *source, *target, class.as_deref(), ctx),
        StepAction::GetAttribute { node, key } => get_attribute(*node, key, ctx),
        StepAction::CheckSafety {
            classes,
            max_distance,
        } => check_safety(classes, *max_distance, ctx),
        StepAction::PredictBehavior { node } => predict_behavior(*node, ctx),
        StepAction::AnswerDirect { .. } => Ok(answer_direct(ctx)),
    }
}

fn count_objects(class: &str, ctx: &ExecutionContext<'_>) -> Result<StepOutput, StepError> {
    if class.trim().is_empty() {
        return Err(StepError::MissingParameter {
            name: "class".to_string(),
        });
    }
    let count = ctx
        .scene_graph
        .nodes
        .iter()
        .filter(|n| class_matches(&n.detection.class, class))
        .count();
    Ok(StepOutput::Count { count })
}

fn check_spatial(
    relation: Option<Relation>,
    source: Option<usize>,
    target: Option<usize>,
    class: Option<&str>,
    ctx: &ExecutionContext<'_>,
) -> Result<StepOutput, StepError> {
    for id in source.iter().chain(target.iter()) {
        ctx.node(*id)?;
    }

    let class_ok = |id: usize| match class {
        Some(c) => ctx
            .scene_graph
            .node(id)
            .map(|n| class_matches(&n.detection.class, c))
            .unwrap_or(false),
        None => true,
    };

    let edges: Vec<_> = ctx
        .scene_graph
        .edges
        .iter()
        .filter(|e| relation.map_or(true, |r| e.relation == r))
        .filter(|e| source.map_or(true, |s| e.source == s))
        .filter(|e| target.map_or(true, |t| e.target == t))
        .filter(|e| match (source, target) {
            (Some(_), None) => class_ok(e.target),
            (None, Some(_)) | (None, None) => class_ok(e.source),
            (Some(_), Some(_)) => true,
        })
        .cloned()
        .collect();

    Ok(StepOutput::Spatial {
        holds: !edges.is_empty(),
        edges,
    })
}

fn get_attribute(node: usize, key: &str, ctx: &ExecutionContext<'_>) -> Result<StepOutput, StepError> {
    let detection = &ctx.node(node)?.detection;
    let value = detection.attributes.get(key).cloned().or_else(|| match key {
        "class" => Some(detection.class.clone()),
        "distance" => Some(format!("{:.1} m", detection.distance)),
        "camera" => Some(detection.camera_view.to_string()),
        _ => None,
    });
    Ok(StepOutput::Attribute {
        node,
        key: key.to_string(),
        value,
    })
}

fn check_safety(
    classes: &[String],
    max_distance: f64,
    ctx: &ExecutionContext<'_>,
) -> Result<StepOutput, StepError> {
    if classes.is_empty() {
        return Err(StepError::MissingParameter {
            name: "classes".to_string(),
        });
    }
    let node_ids: Vec<usize> = ctx
        .scene_graph
        .nodes
        .iter()
        .filter(|n| classes.iter().any(|c| class_matches(&n.detection.class, c)))
        .filter(|n| n.detection.distance <= max_distance)
        .map(|n| n.id)
        .collect();

    Ok(StepOutput::Safety {
        hazard: !node_ids.is_empty(),
        node_ids,
    })
}

fn predict_behavior(node: usize, ctx: &ExecutionContext<'_>) -> Result<StepOutput, StepError> {
    let subject = ctx.node(node)?;
    let detection = &subject.detection;
    let position = detection
        .attributes
        .get("position")
        .map(String::as_str)
        .unwrap_or(detection.position.as_str());

    let state = detection.attributes.get("state").map(|s| s.to_lowercase());
    let outlook = match state.as_deref() {
        Some(s) if s.contains("moving") || s.contains("driving") || s.contains("walking") => {
            "is likely to continue moving"
        }
        Some(s) if s.contains("stop") || s.contains("park") || s.contains("stationary") => {
            "is likely to remain stationary"
        }
        _ if class_matches(&detection.class, "pedestrian") => "may cross or continue along the road",
        _ if class_matches(&detection.class, "vehicle") => "is likely to keep its lane",
        _ => "has no clear motion cue",
    };

    let mut text = format!("The {} on the {} {}", detection.class, position, outlook);

    let neighbours: Vec<String> = ctx
        .scene_graph
        .edges_of(node)
        .filter(|e| e.source == node && matches!(e.relation, Relation::Near | Relation::InFrontOf))
        .filter_map(|e| {
            ctx.scene_graph
                .node(e.target)
                .map(|n| format!("{} the {}", e.relation.as_str().replace('_', " "), n.detection.class))
        })
        .collect();
    if !neighbours.is_empty() {
        text.push_str(&format!(", while {}", neighbours.join(" and ")));
    }
    if detection.attributes.get("range").map(String::as_str) == Some("close") {
        text.push_str("; it is close to the ego vehicle");
    }
    text.push('.');

    Ok(StepOutput::Text { text })
}

fn answer_direct(ctx: &ExecutionContext<'_>) -> StepOutput {
    if ctx.objects.is_empty() {
        let text = if ctx.scene_graph.scene_description.trim().is_empty() {
            "No objects detected in the scene".to_string()
        } else {
            ctx.scene_graph.scene_description.clone()
        };
        return StepOutput::Text { text };
    }

    let listed: Vec<String> = ctx
        .objects
        .iter()
        .map(|o| {
            if o.color.is_empty() {
                format!("{} at {}", o.object, o.position)
            } else {
                format!("{} ({}) at {}", o.object, o.color, o.position)
            }
        })
        .collect();
    let mut text = listed.join("; ");
    if let Some(context) = ctx.perception.vlm_context.as_deref().filter(|c| !c.trim().is_empty()) {
        text.push_str(". ");
        text.push_str(context.trim());
    }
    StepOutput::Text { text }
}

fn compose_answer(records: &[StepRecord]) -> String {
    records
        .iter()
        .filter_map(|r| r.output.as_ref())
        .map(StepOutput::render)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

fn reasoning_chain(plan: &Plan, records: &[StepRecord]) -> String {
    let mut lines = Vec::new();
    if !plan.reasoning.is_empty() {
        lines.push(plan.reasoning.clone());
    }
    for (step, record) in plan.steps.iter().zip(records) {
        let result = match (&record.output, &record.error) {
            (Some(output), _) => output.render(),
            (None, Some(e)) => format!("error: {}", e),
            (None, None) => "no result".to_string(),
        };
        lines.push(format!(
            "Step {}: {} -> {}",
            record.index + 1,
            step.action.describe(),
            result
        ));
    }
    lines.join("\n")
}
