use crate::config::{DetectorKind, PipelineConfig};
use crate::detector::{ObjectDetector, SidecarDetector, VlmDetector};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::frames::CameraImage;
use crate::llm::{InferenceBackend, OllamaClient};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::executor::{ExecutionResult, Executor};
use super::perception::Perception;
use super::planner::{Planner, SafetyRule};
use super::scene_graph::SceneGraphBuilder;
use super::steps::{Plan, StepRecord};
use super::verifier::{VerificationReport, Verifier};

/// Public result of one answered question.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineAnswer {
    pub run_id: String,
    pub question: String,
    pub answer: String,
    pub reasoning: String,
    pub confidence: f64,
    pub scene_graph_summary: String,
    pub verification: VerificationReport,
    pub plan: Plan,
    pub step_results: Vec<StepRecord>,
    /// Pipeline runs spent on this question, including the returned one.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub question: String,
    pub images: Vec<CameraImage>,
}

/// Outcome of one batch item. A failure is never confused with a low-confidence answer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuestionOutcome {
    Answered(PipelineAnswer),
    Failed { kind: ErrorKind, message: String },
}

impl QuestionOutcome {
    pub fn is_answered(&self) -> bool {
        matches!(self, QuestionOutcome::Answered(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub question: String,
    pub outcome: QuestionOutcome,
}

struct Attempt {
    plan: Plan,
    execution: ExecutionResult,
    report: VerificationReport,
    summary: String,
}

pub struct Pipeline {
    config: PipelineConfig,
    perception: Perception,
    builder: SceneGraphBuilder,
    planner: Planner,
    executor: Executor,
    verifier: Verifier,
}

impl Pipeline {
    /// Pipeline talking to the configured inference backend.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let backend: Arc<dyn InferenceBackend> = Arc::new(OllamaClient::new(&config.backend)?);
        let detector: Arc<dyn ObjectDetector> = match config.perception.detector {
            DetectorKind::Vlm => Arc::new(VlmDetector::new(
                backend.clone(),
                &config.backend.vlm_model,
                &config.perception,
            )),
            DetectorKind::Sidecar => Arc::new(SidecarDetector),
        };
        Ok(Self::with_components(config, backend, detector))
    }

    pub fn with_components(
        config: PipelineConfig,
        backend: Arc<dyn InferenceBackend>,
        detector: Arc<dyn ObjectDetector>,
    ) -> Self {
        let perception = Perception::new(
            backend.clone(),
            detector,
            &config.backend.vlm_model,
            config.perception.clone(),
        );
        let planner = Planner::new(
            backend.clone(),
            &config.backend.llm_model,
            config.planner.clone(),
            SafetyRule::from(&config.executor),
        );
        let executor =
            Executor::new(config.executor.clone()).with_summarizer(backend, &config.backend.llm_model);

        Self {
            perception,
            builder: SceneGraphBuilder::new(config.scene_graph.clone()),
            planner,
            executor,
            verifier: Verifier::new(config.verifier.clone()),
            config,
        }
    }

    /// Answer one question. Retries from fresh perception while the verifier asks for it and
    /// returns the most confident attempt.
    pub async fn process(&self, question: &str, images: &[CameraImage]) -> Result<PipelineAnswer> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("question", run_id = %run_id);

        async {
            info!(question, cameras = images.len(), "processing question");

            let mut best: Option<Attempt> = None;
            let mut attempts = 0;

            loop {
                let result = self.run_once(question, images, attempts).await;
                attempts += 1;
                let attempt = match result {
                    Ok(attempt) => attempt,
                    Err(e) if best.is_some() => {
                        warn!(attempt = attempts, error = %e, "retry failed, keeping the earlier answer");
                        break;
                    }
                    Err(e) => return Err(e),
                };

                let retry = attempt.report.retry_recommended;
                let improved = best
                    .as_ref()
                    .map_or(true, |b| attempt.report.confidence > b.report.confidence);
                if improved {
                    best = Some(attempt);
                }
                if !retry {
                    break;
                }
                info!(attempt = attempts, "low confidence, retrying from fresh perception");
            }

            let best = best.ok_or_else(|| PipelineError::Planning {
                reason: "no pipeline attempt completed".to_string(),
            })?;

            info!(
                confidence = best.report.confidence,
                attempts,
                answer = %best.execution.answer,
                "question answered"
            );

            Ok(PipelineAnswer {
                run_id: run_id.clone(),
                question: question.to_string(),
                answer: best.execution.answer,
                reasoning: best.execution.reasoning,
                confidence: best.report.confidence,
                scene_graph_summary: best.summary,
                verification: best.report,
                plan: best.plan,
                step_results: best.execution.step_results,
                attempts,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_once(&self, question: &str, images: &[CameraImage], attempt: u32) -> Result<Attempt> {
        info!(attempt, "[1/5] perception");
        let perception = self
            .perception
            .perceive(images, question, self.config.perception.use_vlm)
            .await?;

        info!(detections = perception.detections.len(), "[2/5] scene graph");
        let graph = self.builder.build(perception);

        info!(nodes = graph.nodes.len(), edges = graph.edges.len(), "[3/5] planning");
        let plan = self.planner.plan(question, &graph).await?;
        debug!(plan = %plan.format(), "plan steps");

        info!(steps = plan.steps.len(), "[4/5] execution");
        let execution = self.executor.execute(&plan, &graph, &graph.raw_perception).await;

        info!("[5/5] verification");
        let report = self.verifier.verify(question, &plan, &execution, &graph, attempt);

        Ok(Attempt {
            summary: graph.summary(),
            plan,
            execution,
            report,
        })
    }

    /// Run independent questions concurrently, bounded by `backend.concurrency`.
    ///
    /// Each question has its own timeout; a failure or timeout only affects its own item.
    /// Outcomes come back in input order.
    pub async fn process_batch(&self, items: Vec<BatchItem>) -> Vec<BatchOutcome> {
        let limit = self.config.backend.concurrency.max(1);
        let secs = self.config.backend.question_timeout_secs;
        info!(items = items.len(), limit, "processing batch");

        stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| async move {
                let result = tokio::time::timeout(
                    Duration::from_secs(secs),
                    self.process(&item.question, &item.images),
                )
                .await
                .unwrap_or_else(|_| Err(PipelineError::Timeout { secs }));

                let outcome = match result {
                    Ok(answer) => QuestionOutcome::Answered(answer),
                    Err(e) => {
                        error!(index, kind = ?e.kind(), error = %e, "question failed");
                        QuestionOutcome::Failed {
                            kind: e.kind(),
                            message: e.to_string(),
                        }
                    }
                };
                BatchOutcome {
                    index,
                    question: item.question,
                    outcome,
                }
            })
            .buffered(limit)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::RawDetection;
    use crate::frames::Frame;
    use crate::test_support::{frame_on_disk, raw, FakeBackend, FakeDetector};
    use crate::types::CameraView;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Detects a car on the first call and fails on every later one.
    struct FailsAfterFirst {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectDetector for FailsAfterFirst {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<RawDetection>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![raw("car", [450, 60, 550, 140])])
            } else {
                Err(PipelineError::BackendUnavailable {
                    attempts: 3,
                    reason: "detector went away".to_string(),
                })
            }
        }
    }

    /// Hangs on rear frames, answers immediately on the rest.
    struct StallsOnRear;

    #[async_trait]
    impl ObjectDetector for StallsOnRear {
        async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>> {
            if frame.view == CameraView::Back {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(vec![raw("car", [450, 60, 550, 140])])
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.perception.use_vlm = false;
        config
    }

    fn pipeline(detector: FakeDetector) -> Pipeline {
        Pipeline::with_components(
            config(),
            Arc::new(FakeBackend::unavailable()),
            Arc::new(detector),
        )
    }

    #[tokio::test]
    async fn test_count_question_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_on_disk(dir.path(), CameraView::Front, 1000, 500);
        let pipeline = pipeline(FakeDetector::new(vec![
            raw("pedestrian", [80, 80, 120, 120]),
            raw("car", [450, 60, 550, 140]),
        ]));

        let answer = pipeline
            .process(
                "how many pedestrians are there",
                &[CameraImage::new(CameraView::Front, frame.path)],
            )
            .await
            .unwrap();
        assert_eq!(answer.answer, "1");
        assert!(answer.confidence >= 0.9);
        assert_eq!(answer.attempts, 1);
        assert!(answer.scene_graph_summary.starts_with("Scene contains 2 objects"));
    }

    #[tokio::test]
    async fn test_low_confidence_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_on_disk(dir.path(), CameraView::Front, 1000, 500);
        let mut config = config();
        config.verifier.retry_threshold = 0.8;
        let pipeline = Pipeline::with_components(
            config,
            Arc::new(FakeBackend::unavailable()),
            Arc::new(FakeDetector::new(vec![raw("car", [450, 60, 550, 140])])),
        );

        let answer = pipeline
            .process(
                "what is <CAM_FRONT,0.9,0.9> going to do",
                &[CameraImage::new(CameraView::Front, frame.path)],
            )
            .await
            .unwrap();
        assert!(answer
            .verification
            .has(crate::agent::verifier::VerificationFlag::UnresolvedReference));
        assert!(answer.confidence < 0.8);
        assert_eq!(answer.attempts, 2);
    }

    #[tokio::test]
    async fn test_failed_retry_keeps_first_answer() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_on_disk(dir.path(), CameraView::Front, 1000, 500);
        let mut config = config();
        config.verifier.retry_threshold = 0.8;
        let pipeline = Pipeline::with_components(
            config,
            Arc::new(FakeBackend::unavailable()),
            Arc::new(FailsAfterFirst {
                calls: AtomicUsize::new(0),
            }),
        );

        let answer = pipeline
            .process(
                "what is <CAM_FRONT,0.9,0.9> going to do",
                &[CameraImage::new(CameraView::Front, frame.path)],
            )
            .await
            .unwrap();
        assert_eq!(answer.attempts, 2);
        assert!(answer.answer.contains("car"), "{}", answer.answer);
        assert!(answer.verification.retry_recommended);
    }

    #[tokio::test]
    async fn test_first_attempt_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_on_disk(dir.path(), CameraView::Front, 1000, 500);
        let pipeline = Pipeline::with_components(
            config(),
            Arc::new(FakeBackend::unavailable()),
            Arc::new(FailsAfterFirst {
                calls: AtomicUsize::new(1),
            }),
        );

        let err = pipeline
            .process("how many cars", &[CameraImage::new(CameraView::Front, frame.path)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Perception);
    }

    #[tokio::test]
    async fn test_timeout_only_fails_its_own_question() {
        let dir = tempfile::tempdir().unwrap();
        let front = frame_on_disk(dir.path(), CameraView::Front, 1000, 500);
        let rear = frame_on_disk(dir.path(), CameraView::Back, 1000, 500);
        let mut config = config();
        config.backend.question_timeout_secs = 1;
        let pipeline = Pipeline::with_components(
            config,
            Arc::new(FakeBackend::unavailable()),
            Arc::new(StallsOnRear),
        );
        let item = |question: &str, frame: &Frame| BatchItem {
            question: question.to_string(),
            images: vec![CameraImage::new(frame.view, frame.path.clone())],
        };

        let outcomes = pipeline
            .process_batch(vec![
                item("how many cars", &front),
                item("how many cars", &rear),
                item("is it safe", &front),
            ])
            .await;

        assert_eq!(outcomes.iter().map(|o| o.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        match &outcomes[0].outcome {
            QuestionOutcome::Answered(answer) => assert_eq!(answer.answer, "1"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(
            outcomes[1].outcome,
            QuestionOutcome::Failed {
                kind: ErrorKind::Timeout,
                ..
            }
        ));
        assert!(outcomes[2].outcome.is_answered());
    }

    #[tokio::test]
    async fn test_default_detector_without_vlm_stays_offline() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_on_disk(dir.path(), CameraView::Front, 1000, 500);
        let boxes = serde_json::json!([{"class": "car", "confidence": 0.9, "bbox": [450, 60, 550, 140]}]);
        std::fs::write(SidecarDetector::sidecar_path(&frame), boxes.to_string()).unwrap();
        let mut config = config();
        config.backend.base_url = "http://127.0.0.1:9".to_string();
        config.backend.max_attempts = 1;

        let answer = Pipeline::new(config)
            .unwrap()
            .process("how many cars", &[CameraImage::new(CameraView::Front, frame.path)])
            .await
            .unwrap();
        assert_eq!(answer.answer, "1");
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_on_disk(dir.path(), CameraView::Front, 1000, 500);
        let pipeline = pipeline(FakeDetector::new(vec![raw("car", [450, 60, 550, 140])]));
        let images = vec![CameraImage::new(CameraView::Front, frame.path)];

        let outcomes = pipeline
            .process_batch(vec![
                BatchItem {
                    question: "how many cars".into(),
                    images: images.clone(),
                },
                BatchItem {
                    question: "".into(),
                    images: images.clone(),
                },
                BatchItem {
                    question: "is it safe".into(),
                    images: vec![CameraImage::new(CameraView::Back, dir.path().join("missing.png"))],
                },
            ])
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.iter().map(|o| o.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(outcomes[0].outcome.is_answered());
        assert!(matches!(
            outcomes[1].outcome,
            QuestionOutcome::Failed {
                kind: ErrorKind::Planning,
                ..
            }
        ));
        assert!(matches!(
            outcomes[2].outcome,
            QuestionOutcome::Failed {
                kind: ErrorKind::Input,
                ..
            }
        ));
    }
}
