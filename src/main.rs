use drive_qa::{CameraImage, CameraView, Pipeline, PipelineConfig, PipelineError, QuestionOutcome};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: drive-qa \"<question>\" VIEW=PATH [VIEW=PATH...]";

fn parse_image(arg: &str) -> Result<CameraImage, PipelineError> {
    let (view, path) = arg
        .split_once('=')
        .ok_or_else(|| PipelineError::Config(format!("expected VIEW=PATH, got {:?}\n{}", arg, USAGE)))?;
    let view: CameraView = view.parse().map_err(PipelineError::Config)?;
    Ok(CameraImage::new(view, PathBuf::from(path)))
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let question = args
        .next()
        .ok_or_else(|| PipelineError::Config(USAGE.to_string()))?;
    let images = args.map(|a| parse_image(&a)).collect::<Result<Vec<_>, _>>()?;
    if images.is_empty() {
        return Err(PipelineError::Config(USAGE.to_string()));
    }

    let config = match std::env::var("DRIVE_QA_CONFIG") {
        Ok(path) => PipelineConfig::load(Path::new(&path))?,
        Err(_) => PipelineConfig::default(),
    };

    let pipeline = Pipeline::new(config)?;
    let outcome = match pipeline.process(&question, &images).await {
        Ok(answer) => QuestionOutcome::Answered(answer),
        Err(e) => QuestionOutcome::Failed {
            kind: e.kind(),
            message: e.to_string(),
        },
    };

    let json = serde_json::to_string_pretty(&outcome)
        .map_err(|e| PipelineError::Config(format!("failed to serialize result: {}", e)))?;
    println!("{}", json);
    Ok(())
}
