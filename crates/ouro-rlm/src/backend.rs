//! LM backend trait and implementations.
//!
//! This module defines the abstraction layer for LM providers and provides
//! a mock implementation for deterministic testing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, RlmError};
use crate::types::{PromptInput, Usage};

/// Execute an async operation with exponential backoff retry.
///
/// Retries only on transient network errors. Everything else is returned
/// immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    backend_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }

                last_error = Some(e);

                if attempt < max_retries {
                    tracing::warn!(
                        backend = backend_name,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap())
}

/// Check if an error is retryable. Only network transport errors qualify.
pub fn is_retryable(error: &RlmError) -> bool {
    matches!(error, RlmError::Network(_))
}

/// The result of one LM call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    /// The response text.
    pub text: String,
    /// The model that produced it.
    pub model: String,
    /// Token usage for the call.
    pub usage: Usage,
}

/// Trait for LM backend providers.
///
/// Implementations connect to an LM service and turn a prompt or message
/// sequence into text plus usage. Credentials come from the process
/// environment, never from arguments.
#[async_trait]
pub trait LmBackend: Send + Sync {
    /// Execute one completion.
    async fn complete(&self, prompt: &PromptInput) -> Result<CompletionOutcome>;

    /// Get the name of this backend.
    fn name(&self) -> &str;

    /// The model id this backend targets.
    fn model(&self) -> &str;

    /// Check if the backend is available and properly configured.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// A backend that can be shared across tasks.
pub type SharedBackend = Arc<dyn LmBackend>;

/// A mock backend for testing purposes.
///
/// Returns pre-configured responses in order; requests past the scripted
/// responses fail loudly.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    model: String,
    usage_per_call: Usage,
    responses: std::sync::Mutex<Vec<String>>,
    request_log: std::sync::Mutex<Vec<PromptInput>>,
}

impl MockBackend {
    /// Create a new mock backend with the given responses.
    pub fn new(responses: Vec<&str>) -> Self {
        Self::with_model("mock-model", responses)
    }

    /// Create a mock backend with an explicit model id.
    pub fn with_model(model: impl Into<String>, responses: Vec<&str>) -> Self {
        Self {
            name: "mock".to_string(),
            model: model.into(),
            usage_per_call: Usage::new(10, 20),
            responses: std::sync::Mutex::new(
                responses.into_iter().map(String::from).collect(),
            ),
            request_log: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a mock backend with a single text response.
    pub fn with_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(vec![text.as_str()])
    }

    /// Override the usage reported per call.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage_per_call = usage;
        self
    }

    /// Get all prompts that were sent to this backend.
    pub fn requests(&self) -> Vec<PromptInput> {
        self.request_log.lock().unwrap().clone()
    }

    /// Get the number of requests made.
    pub fn request_count(&self) -> usize {
        self.request_log.lock().unwrap().len()
    }
}

#[async_trait]
impl LmBackend for MockBackend {
    async fn complete(&self, prompt: &PromptInput) -> Result<CompletionOutcome> {
        self.request_log.lock().unwrap().push(prompt.clone());

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(RlmError::Backend(
                "MockBackend: no more responses available".to_string(),
            ));
        }
        Ok(CompletionOutcome {
            text: responses.remove(0),
            model: self.model.clone(),
            usage: self.usage_per_call,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// A backend that wraps another backend with request/response logging.
pub struct LoggingBackend<B: LmBackend> {
    inner: B,
    name: String,
}

impl<B: LmBackend> LoggingBackend<B> {
    /// Create a new logging backend.
    pub fn new(inner: B) -> Self {
        let name = format!("logging({})", inner.name());
        Self { inner, name }
    }
}

#[async_trait]
impl<B: LmBackend> LmBackend for LoggingBackend<B> {
    async fn complete(&self, prompt: &PromptInput) -> Result<CompletionOutcome> {
        tracing::debug!(
            backend = self.inner.name(),
            model = self.inner.model(),
            prompt = %prompt.preview(120),
            "Sending completion request"
        );

        let start = std::time::Instant::now();
        let result = self.inner.complete(prompt).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(outcome) => {
                tracing::debug!(
                    backend = self.inner.name(),
                    model = %outcome.model,
                    input_tokens = outcome.usage.input_tokens,
                    output_tokens = outcome.usage.output_tokens,
                    duration_ms = elapsed.as_millis() as u64,
                    "Completion successful"
                );
            }
            Err(e) => {
                tracing::warn!(
                    backend = self.inner.name(),
                    error = %e,
                    duration_ms = elapsed.as_millis() as u64,
                    "Completion failed"
                );
            }
        }

        result
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

/// Create a backend from its configuration id.
///
/// `kwargs` is the opaque `backend_kwargs` mapping from the driver
/// configuration, forwarded to the backend constructor.
pub fn create_backend(id: &str, kwargs: &serde_json::Value) -> Result<SharedBackend> {
    match id {
        "openai" => {
            let config = crate::openai::OpenAiConfig::from_kwargs(kwargs)?;
            Ok(Arc::new(crate::openai::OpenAiBackend::new(config)?))
        }
        other => Err(RlmError::Config(format!("unknown backend '{}'", other))),
    }
}
