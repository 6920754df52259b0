//! The completion driver: the agent loop.
//!
//! One top-level call alternates LM turns with code execution until a
//! final-answer sentinel appears or a budget runs out. Each call owns a
//! scoped bundle (LM handler + environment) that is released on every
//! exit path. Recursion is modeled by value: `llm_query` from inside the
//! environment is served by a sub-driver at `depth + 1`, which
//! short-circuits to a plain LM call at the depth limit.

mod scope;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use ouro_tracing::{NullSink, TrajectoryRecord, TrajectorySink};

use crate::backend::{CompletionOutcome, SharedBackend, create_backend};
use crate::environment::Environment;
use crate::error::{Result, RlmError};
use crate::handler::{SubcallOutcome, SubcallRouter};
use crate::parser;
use crate::prompts;
use crate::types::{
    ChatCompletion, CodeBlock, CompletionMetadata, Message, PromptInput, RlmIteration, StopReason,
    Usage, UsageSummary,
};

use scope::CallScope;

/// Configuration for the completion driver.
#[derive(Debug, Clone)]
pub struct RlmConfig {
    /// LM backend id (see `create_backend`).
    pub backend: String,
    /// Opaque mapping forwarded to the backend constructor.
    pub backend_kwargs: serde_json::Value,
    /// Environment id (see `create_environment`).
    pub environment: String,
    /// Opaque mapping forwarded to the environment; may include a
    /// `setup_code` snippet executed once after setup.
    pub environment_kwargs: serde_json::Value,
    /// Replaces the default system prompt when set.
    pub custom_system_prompt: Option<String>,
    /// Hard cap on LM turns per top-level call. Must be at least 1.
    pub max_iterations: usize,
    /// Hard cap on recursion depth. At `depth == max_depth` the driver
    /// takes the fallback path.
    pub max_depth: u32,
    /// Deadline for one LM call.
    pub per_call_timeout: Option<Duration>,
    /// Wall-clock budget for a whole completion; overrides the iteration
    /// budget when it expires first.
    pub wall_clock: Option<Duration>,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            backend: "openai".to_string(),
            backend_kwargs: serde_json::json!({}),
            environment: "local".to_string(),
            environment_kwargs: serde_json::json!({}),
            custom_system_prompt: None,
            max_iterations: 10,
            max_depth: 1,
            per_call_timeout: Some(Duration::from_secs(600)),
            wall_clock: None,
        }
    }
}

impl RlmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, id: impl Into<String>) -> Self {
        self.backend = id.into();
        self
    }

    pub fn with_backend_kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.backend_kwargs = kwargs;
        self
    }

    pub fn with_environment(mut self, id: impl Into<String>) -> Self {
        self.environment = id.into();
        self
    }

    pub fn with_environment_kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.environment_kwargs = kwargs;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = Some(timeout);
        self
    }

    pub fn with_wall_clock(mut self, budget: Duration) -> Self {
        self.wall_clock = Some(budget);
        self
    }
}

/// The RLM completion driver.
#[derive(Clone)]
pub struct Rlm {
    backend: SharedBackend,
    subcall_backend: SharedBackend,
    config: RlmConfig,
    depth: u32,
    sink: Arc<dyn TrajectorySink>,
}

impl Rlm {
    /// Build a driver from configuration, instantiating the backend.
    pub fn new(config: RlmConfig) -> Result<Self> {
        Self::validate(&config)?;
        let backend = create_backend(&config.backend, &config.backend_kwargs)?;
        Ok(Self {
            subcall_backend: Arc::clone(&backend),
            backend,
            config,
            depth: 0,
            sink: Arc::new(NullSink),
        })
    }

    /// Build a driver around an existing backend instance.
    pub fn with_backend(backend: SharedBackend, config: RlmConfig) -> Result<Self> {
        Self::validate(&config)?;
        Ok(Self {
            subcall_backend: Arc::clone(&backend),
            backend,
            config,
            depth: 0,
            sink: Arc::new(NullSink),
        })
    }

    /// Serve `llm_query` sub-calls with a different backend.
    pub fn with_subcall_backend(mut self, backend: SharedBackend) -> Self {
        self.subcall_backend = backend;
        self
    }

    /// Attach a trajectory sink.
    pub fn with_sink(mut self, sink: Arc<dyn TrajectorySink>) -> Self {
        self.sink = sink;
        self
    }

    fn validate(config: &RlmConfig) -> Result<()> {
        if config.max_iterations == 0 {
            return Err(RlmError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Run one top-level completion with a per-call environment.
    pub async fn completion(&self, prompt: impl Into<PromptInput>) -> Result<ChatCompletion> {
        let prompt = prompt.into();
        if self.depth >= self.config.max_depth {
            return self.fallback(&prompt).await;
        }
        let scope = CallScope::open(self).await?;
        self.drive(&prompt, scope).await
    }

    /// Run one top-level completion against a caller-owned environment.
    ///
    /// Used for multi-turn persistence: the caller keeps the environment
    /// across completions and each driver rebinds it to a fresh handler.
    pub async fn completion_in(
        &self,
        prompt: impl Into<PromptInput>,
        env: &mut dyn Environment,
    ) -> Result<ChatCompletion> {
        let prompt = prompt.into();
        if self.depth >= self.config.max_depth {
            return self.fallback(&prompt).await;
        }
        let scope = CallScope::open_with(self, env).await?;
        self.drive(&prompt, scope).await
    }

    async fn drive(&self, prompt: &PromptInput, mut scope: CallScope<'_>) -> Result<ChatCompletion> {
        let outcome = self.run_loop(prompt, &mut scope).await;
        let handler_usage = scope.close().await;
        match outcome {
            Ok(mut completion) => {
                completion.usage.merge(&handler_usage);
                self.sink.emit(&TrajectoryRecord::done(&serde_json::json!({
                    "response": completion.response,
                    "truncated": completion.metadata.truncated,
                    "stop": completion.metadata.stop,
                    "iterations": completion.iterations.len(),
                    "total_tokens": completion.usage.total_tokens(),
                })));
                Ok(completion)
            }
            Err(e) => {
                self.sink.emit(&TrajectoryRecord::error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Depth-limit short circuit: one plain LM call, no iterations.
    async fn fallback(&self, prompt: &PromptInput) -> Result<ChatCompletion> {
        let started = Instant::now();
        tracing::debug!(depth = self.depth, "depth limit reached, plain completion");

        let outcome = self.lm_call(prompt).await?;
        let mut usage = UsageSummary::new();
        usage.record(&outcome.model, &outcome.usage);

        self.sink.emit(&TrajectoryRecord::done(&serde_json::json!({
            "response": outcome.text,
            "fallback": true,
            "depth": self.depth,
        })));

        Ok(ChatCompletion {
            response: outcome.text,
            iterations: Vec::new(),
            usage,
            metadata: CompletionMetadata {
                truncated: false,
                fallback: true,
                depth: self.depth,
                duration_ms: started.elapsed().as_millis() as u64,
                stop: StopReason::Fallback,
            },
        })
    }

    async fn run_loop(
        &self,
        prompt: &PromptInput,
        scope: &mut CallScope<'_>,
    ) -> Result<ChatCompletion> {
        let started = Instant::now();
        let mut usage = UsageSummary::new();
        let mut iterations: Vec<RlmIteration> = Vec::new();

        let system = self
            .config
            .custom_system_prompt
            .clone()
            .unwrap_or_else(|| prompts::CORE_BEHAVIOR.to_string());
        let mut history = vec![Message::system(system)];
        history.extend(prompt.to_messages());

        self.sink.emit(&TrajectoryRecord::metadata(&serde_json::json!({
            "backend": self.backend.name(),
            "model": self.backend.model(),
            "environment": self.config.environment,
            "max_iterations": self.config.max_iterations,
            "max_depth": self.config.max_depth,
            "depth": self.depth,
        })));

        let mut stop = StopReason::MaxIterations;
        let mut final_answer: Option<String> = None;

        for turn in 0..self.config.max_iterations {
            if let Some(budget) = self.config.wall_clock {
                if started.elapsed() >= budget {
                    tracing::warn!(turn, "wall-clock budget spent");
                    stop = StopReason::WallClock;
                    break;
                }
            }

            let turn_started = Instant::now();
            let timestamp = Utc::now();
            let outcome = match self
                .lm_call(&PromptInput::Messages(history.clone()))
                .await
            {
                Ok(outcome) => outcome,
                Err(RlmError::Timeout(message)) => {
                    tracing::warn!(turn, %message, "LM call deadline expired");
                    stop = StopReason::Timeout;
                    break;
                }
                Err(e) => return Err(e),
            };
            usage.record(&outcome.model, &outcome.usage);
            history.push(Message::assistant(outcome.text.clone()));

            let parsed = parser::parse_response(&outcome.text);
            // An answer before the first code region wins outright; an
            // answer after code lets the regions before it execute first.
            // Regions after the sentinel never run.
            let executable = match parsed.final_answer.as_ref() {
                Some(answer) => answer.preceding_blocks,
                None => parsed.code_blocks.len(),
            };

            let mut code_blocks = Vec::with_capacity(executable);
            for (block_index, code) in parsed.code_blocks.iter().take(executable).enumerate() {
                let tag = (turn, block_index);
                scope.handler().begin_block(tag);
                let executed = scope.env().execute_code(code).await;
                let calls = scope.handler().finish_block(tag);
                let mut result = executed?;
                result.rlm_calls = calls;
                tracing::debug!(
                    turn,
                    block = block_index,
                    stdout_bytes = result.stdout.len(),
                    failed = result.is_err(),
                    child_calls = result.rlm_calls.len(),
                    "code block executed"
                );
                code_blocks.push(CodeBlock {
                    code: code.clone(),
                    result,
                });
            }

            let answer = parsed.final_answer.map(|a| a.text);
            let iteration = RlmIteration {
                index: turn,
                timestamp,
                response: outcome.text,
                code_blocks,
                final_answer: answer.clone(),
                elapsed_secs: turn_started.elapsed().as_secs_f64(),
            };
            self.sink.emit(&TrajectoryRecord::iteration(&iteration));
            iterations.push(iteration);

            if let Some(answer) = answer {
                final_answer = Some(answer);
                stop = StopReason::FinalAnswer;
                break;
            }

            let summary = format_block_results(&iterations.last().unwrap().code_blocks);
            history.push(Message::user(format!(
                "{}\n\n{}",
                summary,
                prompts::continue_prompt(turn, self.config.max_iterations)
            )));
        }

        let truncated = final_answer.is_none();
        let response = final_answer.unwrap_or_else(|| synthesize_answer(&iterations));
        Ok(ChatCompletion {
            response,
            iterations,
            usage,
            metadata: CompletionMetadata {
                truncated,
                fallback: false,
                depth: self.depth,
                duration_ms: started.elapsed().as_millis() as u64,
                stop,
            },
        })
    }

    async fn lm_call(&self, prompt: &PromptInput) -> Result<CompletionOutcome> {
        match self.config.per_call_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.backend.complete(prompt))
                .await
                .map_err(|_| RlmError::Timeout(format!("LM call exceeded {:?}", deadline)))?,
            None => self.backend.complete(prompt).await,
        }
    }

    /// The driver serving `llm_query` sub-calls, one level deeper.
    fn subcall_driver(&self) -> Rlm {
        Rlm {
            backend: Arc::clone(&self.subcall_backend),
            subcall_backend: Arc::clone(&self.subcall_backend),
            config: self.config.clone(),
            depth: self.depth + 1,
            sink: Arc::clone(&self.sink),
        }
    }
}

/// Serves handler queries with a full sub-completion.
pub(crate) struct RecursiveRouter {
    driver: Rlm,
}

impl RecursiveRouter {
    pub(crate) fn new(driver: Rlm) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl SubcallRouter for RecursiveRouter {
    async fn route(&self, prompt: PromptInput) -> Result<SubcallOutcome> {
        let completion = self.driver.completion(prompt).await?;
        let usage = Usage::new(
            completion.usage.total_input_tokens(),
            completion.usage.total_output_tokens(),
        );
        Ok(SubcallOutcome {
            text: completion.response,
            model: self.driver.backend.model().to_string(),
            usage,
            summary: completion.usage,
        })
    }
}

/// The synthesized "tool result" user message for one turn.
fn format_block_results(blocks: &[CodeBlock]) -> String {
    if blocks.is_empty() {
        return "(no code was executed this turn)".to_string();
    }

    let mut out = String::new();
    for (i, block) in blocks.iter().enumerate() {
        if blocks.len() > 1 {
            out.push_str(&format!("Block {} result:\n", i + 1));
        }
        let stdout = block.result.stdout.trim_end();
        out.push_str("```output\n");
        out.push_str(if stdout.is_empty() { "(no output)" } else { stdout });
        out.push_str("\n```\n");
        if !block.result.stderr.is_empty() {
            out.push_str("```error\n");
            out.push_str(block.result.stderr.trim_end());
            out.push_str("\n```\n");
        }
        if !block.result.bindings.is_empty() {
            let vars: Vec<String> = block
                .result
                .bindings
                .iter()
                .take(8)
                .map(|(name, preview)| format!("{}={}", name, preview))
                .collect();
            out.push_str(&format!("variables: {}\n", vars.join(", ")));
        }
    }
    out.trim_end().to_string()
}

/// Default answer when the loop exhausts its budget: the last assistant
/// turn with its code regions stripped.
fn synthesize_answer(iterations: &[RlmIteration]) -> String {
    let Some(last) = iterations.last() else {
        return "(no answer produced)".to_string();
    };

    let mut kept = Vec::new();
    let mut in_fence = false;
    for line in last.response.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            kept.push(line);
        }
    }
    let text = kept.join("\n").trim().to_string();
    if text.is_empty() {
        "(no answer produced within the iteration budget)".to_string()
    } else {
        text
    }
}
