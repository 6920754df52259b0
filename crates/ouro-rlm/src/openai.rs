//! OpenAI-compatible chat-completions backend.
//!
//! Works against the hosted API as well as any server exposing the same
//! surface (vLLM, Ollama, llama.cpp). The API key is read from the process
//! environment (`OURO_API_KEY`, then `OPENAI_API_KEY`); it is never passed
//! as an argument.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};

use crate::backend::{CompletionOutcome, LmBackend, with_retry};
use crate::error::{Result, RlmError};
use crate::types::{PromptInput, Role, Usage};

/// Default API base URL.
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Default model.
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Environment variables consulted for the API key, in order.
const API_KEY_VARS: &[&str] = &["OURO_API_KEY", "OPENAI_API_KEY"];

/// Configuration for the OpenAI-compatible backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// Base URL for the API.
    pub base_url: String,

    /// Model to use for completions.
    pub model: String,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Maximum tokens to generate per call.
    pub max_tokens: Option<u32>,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Maximum retries for transient errors.
    pub max_retries: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: 3,
        }
    }
}

impl OpenAiConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set a custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Build a config from the opaque `backend_kwargs` mapping.
    pub fn from_kwargs(kwargs: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(kwargs.clone())
            .map_err(|e| RlmError::Config(format!("invalid backend_kwargs: {}", e)))
    }
}

/// OpenAI-compatible backend.
pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
    api_key: Option<String>,
}

impl OpenAiBackend {
    /// Create a new backend with the given configuration.
    ///
    /// A missing API key is a configuration error against the hosted
    /// default base URL; custom base URLs (local servers) may run keyless.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let api_key = API_KEY_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());

        if api_key.is_none() && config.base_url == DEFAULT_API_BASE {
            return Err(RlmError::Config(format!(
                "no API key in environment (checked {})",
                API_KEY_VARS.join(", ")
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RlmError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn to_wire_request(&self, prompt: &PromptInput) -> ChatRequest {
        let messages = prompt
            .to_messages()
            .into_iter()
            .map(|m| WireMessage {
                role: role_str(m.role).to_string(),
                content: m.content,
            })
            .collect();

        ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    async fn send_once(&self, request: &ChatRequest) -> Result<CompletionOutcome> {
        let mut builder = self
            .client
            .post(self.completions_url())
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 5xx and 429 come back as retryable network faults.
            let truncated = crate::types::truncate_preview(&body, 300);
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(RlmError::Network(format!("HTTP {}: {}", status, truncated)));
            }
            return Err(RlmError::Backend(format!("HTTP {}: {}", status, truncated)));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| RlmError::Backend(format!("malformed response body: {}", e)))?;

        let text = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let usage = body
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let model = body.model.unwrap_or_else(|| self.config.model.clone());

        Ok(CompletionOutcome { text, model, usage })
    }
}

#[async_trait]
impl LmBackend for OpenAiBackend {
    async fn complete(&self, prompt: &PromptInput) -> Result<CompletionOutcome> {
        let request = self.to_wire_request(prompt);
        with_retry(
            self.config.max_retries,
            Duration::from_millis(500),
            "openai",
            || self.send_once(&request),
        )
        .await
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn health_check(&self) -> Result<()> {
        // Listing models is the cheapest authenticated round-trip.
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.client.get(url);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RlmError::Backend(format!(
                "health check failed: HTTP {}",
                response.status()
            )))
        }
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn test_config_builder() {
        let config = OpenAiConfig::new()
            .with_model("gpt-4o")
            .with_base_url("http://localhost:8000/v1")
            .with_timeout(Duration::from_secs(30));

        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.base_url, "http://localhost:8000/v1");
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn test_config_from_kwargs() {
        let kwargs = serde_json::json!({
            "model": "qwen2.5-coder",
            "base_url": "http://localhost:11434/v1",
            "temperature": 0.2
        });
        let config = OpenAiConfig::from_kwargs(&kwargs).unwrap();
        assert_eq!(config.model, "qwen2.5-coder");
        assert_eq!(config.temperature, Some(0.2));
        // Unspecified fields fall back to defaults.
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_config_rejects_malformed_kwargs() {
        let kwargs = serde_json::json!({"timeout_secs": "not a number"});
        assert!(OpenAiConfig::from_kwargs(&kwargs).is_err());
    }

    #[test]
    fn test_wire_request_from_text_prompt() {
        // Keyless is allowed for non-default base URLs.
        let config = OpenAiConfig::new().with_base_url("http://localhost:1234/v1");
        let backend = OpenAiBackend::new(config).unwrap();

        let request = backend.to_wire_request(&"Say hi".into());
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, "user");
        assert_eq!(request.messages[0].content, "Say hi");
    }

    #[test]
    fn test_wire_request_preserves_message_roles() {
        let config = OpenAiConfig::new().with_base_url("http://localhost:1234/v1");
        let backend = OpenAiBackend::new(config).unwrap();

        let prompt: PromptInput = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
        ]
        .into();
        let request = backend.to_wire_request(&prompt);
        let roles: Vec<&str> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
    }

    #[test]
    fn test_completions_url_trims_trailing_slash() {
        let config = OpenAiConfig::new().with_base_url("http://localhost:1234/v1/");
        let backend = OpenAiBackend::new(config).unwrap();
        assert_eq!(
            backend.completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
    }
}
