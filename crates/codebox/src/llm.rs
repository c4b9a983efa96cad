use std::io;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434/api/generate";

const REQUEST_TIMEOUT_SECS: u64 = 120;
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Error: {status} - {body}")]
    Status { status: u16, body: String },
    #[error("Error querying Ollama: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Error querying Ollama: response body has no generated text")]
    InvalidResponse,
    #[error("Error querying Ollama: failed to start request runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError>;
}

/// Client for a local Ollama `/api/generate` endpoint.
pub struct OllamaClient {
    client: Client,
    endpoint: String,
}

impl OllamaClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, LlmError> {
        // Every call runs on its own short-lived runtime, so pooled
        // connections would be bound to a runtime that no longer exists.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "inference endpoint rejected request");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        parsed.response.ok_or(LlmError::InvalidResponse)
    }
}

/// Runs one generation to completion from synchronous code.
///
/// A current-thread runtime is created for the request and dropped with it.
/// Called from inside a runtime, the request moves to a scoped thread so
/// the caller's runtime is never blocked on directly.
pub fn infer(client: &dyn LlmClient, prompt: &str, model: &str) -> Result<String, LlmError> {
    if tokio::runtime::Handle::try_current().is_err() {
        return run_to_completion(client, prompt, model);
    }
    thread::scope(|scope| {
        scope
            .spawn(|| run_to_completion(client, prompt, model))
            .join()
            .unwrap_or_else(|_| {
                Err(LlmError::Runtime(io::Error::other("inference thread panicked")))
            })
    })
}

fn run_to_completion(client: &dyn LlmClient, prompt: &str, model: &str) -> Result<String, LlmError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .map_err(LlmError::Runtime)?;
    let started = Instant::now();
    let result = runtime.block_on(client.generate(model, prompt));
    tracing::debug!(
        model,
        ok = result.is_ok(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "inference finished"
    );
    result
}
