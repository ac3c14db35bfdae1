pub mod executor;
pub mod orchestrator;
pub mod perception;
pub mod planner;
pub mod prompts;
pub mod scene_graph;
pub mod steps;
pub mod verifier;
pub mod vocabulary;

pub use executor::{ExecutionContext, ExecutionResult, Executor};
pub use orchestrator::{BatchItem, BatchOutcome, Pipeline, PipelineAnswer, QuestionOutcome};
pub use perception::Perception;
pub use planner::Planner;
pub use scene_graph::SceneGraphBuilder;
pub use steps::{Plan, PlanStep, StepAction, StepKind, StepOutput, StepRecord};
pub use verifier::{VerificationFlag, VerificationReport, Verifier};
