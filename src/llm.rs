use crate::config::BackendConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// One generation call: a prompt, optionally grounded on base64 images.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: String,
    pub images: Vec<String>,
    pub temperature: f32,
}

impl InferenceRequest {
    pub fn text(model: &str, prompt: String) -> Self {
        Self {
            model: model.to_string(),
            prompt,
            images: vec![],
            temperature: 0.0,
        }
    }

    pub fn with_images(model: &str, prompt: String, images: Vec<String>) -> Self {
        Self {
            images,
            ..Self::text(model, prompt)
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// The remote VLM/LLM service. Implementations must be shareable across questions.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, request: &InferenceRequest) -> Result<String>;
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: &'a [String],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

enum CallFailure {
    Retryable(String),
    Fatal(PipelineError),
}

/// Ollama `/api/generate` client with bounded retries and exponential backoff.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    max_attempts: u32,
    backoff: Duration,
}

impl OllamaClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.concurrency.max(1))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    async fn call_once(&self, request: &InferenceRequest) -> std::result::Result<String, CallFailure> {
        let body = OllamaRequest {
            model: &request.model,
            prompt: &request.prompt,
            images: &request.images,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallFailure::Retryable("request timed out".to_string())
                } else {
                    CallFailure::Retryable(format!("Failed to call Ollama: {}. Is Ollama running?", e))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CallFailure::Retryable(format!("backend returned {}", status)));
        }
        if !status.is_success() {
            return Err(CallFailure::Fatal(PipelineError::BackendResponse(format!(
                "backend returned {} for model {}",
                status, request.model
            ))));
        }

        let parsed: OllamaResponse = response.json().await.map_err(|e| {
            CallFailure::Fatal(PipelineError::BackendResponse(format!(
                "Failed to parse Ollama response: {}",
                e
            )))
        })?;

        Ok(parsed.response.trim().to_string())
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    async fn generate(&self, request: &InferenceRequest) -> Result<String> {
        let mut delay = self.backoff;
        let mut last_reason = String::new();

        for attempt in 1..=self.max_attempts {
            debug!(
                model = %request.model,
                attempt,
                images = request.images.len(),
                "calling inference backend"
            );
            match self.call_once(request).await {
                Ok(text) => return Ok(text),
                Err(CallFailure::Fatal(e)) => return Err(e),
                Err(CallFailure::Retryable(reason)) => {
                    warn!(attempt, max = self.max_attempts, %reason, "inference call failed");
                    last_reason = reason;
                    if attempt < self.max_attempts {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(PipelineError::BackendUnavailable {
            attempts: self.max_attempts,
            reason: last_reason,
        })
    }
}

/// Extract the first balanced JSON array or object from a model response.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
