use crate::config::VerifierConfig;
use crate::types::SceneGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::executor::ExecutionResult;
use super::steps::{Plan, StepAction, StepOutput};
use super::vocabulary::class_matches;

/// Inconsistency labels raised while verifying one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFlag {
    StepError,
    UnknownNodeReference,
    CountMismatch,
    UnsupportedSafetyClaim,
    EmptyAnswer,
    UnresolvedReference,
    PerceptionDegraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub confidence: f64,
    pub flags: BTreeSet<VerificationFlag>,
    pub retry_recommended: bool,
    pub checks_passed: usize,
    pub checks_total: usize,
}

impl VerificationReport {
    pub fn has(&self, flag: VerificationFlag) -> bool {
        self.flags.contains(&flag)
    }
}

#[derive(Default)]
struct Checks {
    passed: usize,
    total: usize,
    flags: BTreeSet<VerificationFlag>,
}

impl Checks {
    fn record(&mut self, ok: bool, flag: VerificationFlag) {
        self.total += 1;
        if ok {
            self.passed += 1;
        } else {
            self.flags.insert(flag);
        }
    }

    fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Score a finished run. `attempt` is the number of retries already spent on this question.
    pub fn verify(
        &self,
        question: &str,
        plan: &Plan,
        execution: &ExecutionResult,
        graph: &SceneGraph,
        attempt: u32,
    ) -> VerificationReport {
        let mut checks = Checks::default();

        for step in &plan.steps {
            for id in step.action.referenced_nodes() {
                checks.record(graph.node(id).is_some(), VerificationFlag::UnknownNodeReference);
            }
        }

        for resolution in &plan.resolutions {
            checks.record(resolution.node.is_some(), VerificationFlag::UnresolvedReference);
        }

        for (step, record) in plan.steps.iter().zip(&execution.step_results) {
            match (&step.action, &record.output) {
                (StepAction::CountObjects { class }, Some(StepOutput::Count { count })) => {
                    let recount = graph
                        .nodes
                        .iter()
                        .filter(|n| class_matches(&n.detection.class, class))
                        .count();
                    checks.record(recount == *count, VerificationFlag::CountMismatch);
                }
                (_, Some(StepOutput::Safety { hazard: true, node_ids })) => {
                    let supported =
                        !node_ids.is_empty() && node_ids.iter().all(|id| graph.node(*id).is_some());
                    checks.record(supported, VerificationFlag::UnsupportedSafetyClaim);
                }
                _ => {}
            }
        }

        checks.record(!execution.answer.trim().is_empty(), VerificationFlag::EmptyAnswer);

        let total_steps = execution.step_results.len();
        let failed_steps = execution.failed_steps();
        if failed_steps > 0 {
            checks.flags.insert(VerificationFlag::StepError);
        }
        if graph.raw_perception.is_degraded() {
            checks.flags.insert(VerificationFlag::PerceptionDegraded);
        }

        let step_fraction = if total_steps == 0 {
            0.0
        } else {
            (total_steps - failed_steps) as f64 / total_steps as f64
        };
        let weight_sum = self.config.step_weight + self.config.check_weight;
        let confidence = if weight_sum > 0.0 {
            (self.config.step_weight * step_fraction + self.config.check_weight * checks.fraction())
                / weight_sum
        } else {
            0.0
        }
        .clamp(0.0, 1.0);

        let retry_recommended =
            confidence < self.config.retry_threshold && attempt < self.config.max_retries;

        debug!(question, passed = checks.passed, total = checks.total, "cross-checks done");
        info!(confidence, flags = ?checks.flags, retry_recommended, "verification finished");

        VerificationReport {
            confidence,
            flags: checks.flags,
            retry_recommended,
            checks_passed: checks.passed,
            checks_total: checks.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::scene_graph::SceneGraphBuilder;
    use crate::agent::steps::{PlanMethod, PlanStep, StepRecord};
    use crate::config::SceneGraphConfig;
    use crate::error::StepError;
    use crate::test_support::{detection_at, perception_of};
    use crate::types::{CameraView, PerceptionFlag};

    fn scene() -> SceneGraph {
        SceneGraphBuilder::new(SceneGraphConfig::default()).build(perception_of(vec![
            detection_at("pedestrian", CameraView::Front, 100.0, 100.0, 8.0),
            detection_at("car", CameraView::Front, 500.0, 100.0, 20.0),
        ]))
    }

    fn plan_of(actions: Vec<StepAction>) -> Plan {
        Plan {
            id: "test".to_string(),
            question: "q".to_string(),
            steps: actions.into_iter().map(|a| PlanStep::new(a, "")).collect(),
            reasoning: String::new(),
            resolutions: vec![],
            method: PlanMethod::Rules,
        }
    }

    fn record(index: usize, plan: &Plan, output: Option<StepOutput>, error: Option<StepError>) -> StepRecord {
        StepRecord {
            index,
            kind: plan.steps[index].kind(),
            output,
            error,
        }
    }

    fn verifier() -> Verifier {
        Verifier::new(VerifierConfig::default())
    }

    #[test]
    fn test_consistent_count_is_fully_confident() {
        let plan = plan_of(vec![StepAction::CountObjects {
            class: "pedestrian".into(),
        }]);
        let execution = ExecutionResult {
            answer: "1".into(),
            reasoning: String::new(),
            step_results: vec![record(0, &plan, Some(StepOutput::Count { count: 1 }), None)],
        };
        let report = verifier().verify("how many pedestrians", &plan, &execution, &scene(), 0);
        assert!(report.confidence >= 0.9);
        assert!(report.flags.is_empty());
        assert!(!report.retry_recommended);
    }

    #[test]
    fn test_count_mismatch_flagged() {
        let plan = plan_of(vec![StepAction::CountObjects { class: "car".into() }]);
        let execution = ExecutionResult {
            answer: "3".into(),
            reasoning: String::new(),
            step_results: vec![record(0, &plan, Some(StepOutput::Count { count: 3 }), None)],
        };
        let report = verifier().verify("how many cars", &plan, &execution, &scene(), 0);
        assert!(report.has(VerificationFlag::CountMismatch));
        assert_eq!(report.checks_passed, 1);
        assert_eq!(report.checks_total, 2);
    }

    #[test]
    fn test_failed_steps_trigger_retry_once() {
        let plan = plan_of(vec![StepAction::PredictBehavior { node: 9 }]);
        let execution = ExecutionResult {
            answer: String::new(),
            reasoning: String::new(),
            step_results: vec![record(0, &plan, None, Some(StepError::UnknownNode { id: 9 }))],
        };
        let graph = scene();
        let report = verifier().verify("q", &plan, &execution, &graph, 0);
        assert_eq!(report.confidence, 0.0);
        assert!(report.has(VerificationFlag::StepError));
        assert!(report.has(VerificationFlag::UnknownNodeReference));
        assert!(report.has(VerificationFlag::EmptyAnswer));
        assert!(report.retry_recommended);

        let report = verifier().verify("q", &plan, &execution, &graph, 1);
        assert!(!report.retry_recommended);
    }

    #[test]
    fn test_hazard_without_nodes_is_unsupported() {
        let plan = plan_of(vec![StepAction::CheckSafety {
            classes: vec!["pedestrian".into()],
            max_distance: 10.0,
        }]);
        let execution = ExecutionResult {
            answer: "Caution".into(),
            reasoning: String::new(),
            step_results: vec![record(
                0,
                &plan,
                Some(StepOutput::Safety {
                    hazard: true,
                    node_ids: vec![],
                }),
                None,
            )],
        };
        let report = verifier().verify("is it safe", &plan, &execution, &scene(), 0);
        assert!(report.has(VerificationFlag::UnsupportedSafetyClaim));
    }

    #[test]
    fn test_degraded_perception_is_flagged() {
        let mut perception = perception_of(vec![]);
        perception.flags.push(PerceptionFlag::NoDetections);
        let graph = SceneGraphBuilder::new(SceneGraphConfig::default()).build(perception);
        let plan = plan_of(vec![StepAction::AnswerDirect { reason: "x".into() }]);
        let execution = ExecutionResult {
            answer: "A quiet street".into(),
            reasoning: String::new(),
            step_results: vec![record(
                0,
                &plan,
                Some(StepOutput::Text {
                    text: "A quiet street".into(),
                }),
                None,
            )],
        };
        let report = verifier().verify("q", &plan, &execution, &graph, 0);
        assert!(report.has(VerificationFlag::PerceptionDegraded));
        assert!(report.confidence >= 0.9);
    }
}
