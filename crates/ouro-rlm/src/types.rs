//! Core types for the RLM runtime.
//!
//! These carry the data produced by one top-level completion: the message
//! history, per-block execution results, iteration records, and aggregated
//! token usage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,

    /// The text content of the message.
    pub content: String,
}

impl Message {
    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// A prompt handed to the runtime or carried on the wire: either plain text
/// or a full message sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    /// Simple text prompt.
    Text(String),
    /// Full message sequence.
    Messages(Vec<Message>),
}

impl PromptInput {
    /// Render as a message sequence (a text prompt becomes one user message).
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            PromptInput::Text(s) => vec![Message::user(s.clone())],
            PromptInput::Messages(msgs) => msgs.clone(),
        }
    }

    /// A truncated single-line preview for trace records.
    pub fn preview(&self, max_len: usize) -> String {
        let text = match self {
            PromptInput::Text(s) => s.clone(),
            PromptInput::Messages(msgs) => msgs
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        };
        truncate_preview(&text, max_len)
    }
}

impl From<&str> for PromptInput {
    fn from(s: &str) -> Self {
        PromptInput::Text(s.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(s: String) -> Self {
        PromptInput::Text(s)
    }
}

impl From<Vec<Message>> for PromptInput {
    fn from(msgs: Vec<Message>) -> Self {
        PromptInput::Messages(msgs)
    }
}

/// Truncate a string for previews, marking elided content.
pub fn truncate_preview(content: &str, max_len: usize) -> String {
    if content.len() <= max_len {
        content.to_string()
    } else {
        let cut = content
            .char_indices()
            .take_while(|(i, _)| *i < max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!(
            "{}... [truncated, {} total chars]",
            &content[..cut],
            content.len()
        )
    }
}

/// Token usage for a single LM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the input.
    pub input_tokens: u64,
    /// Tokens in the output.
    pub output_tokens: u64,
}

impl Usage {
    /// Create new usage statistics.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens used.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-model usage counters. Counters only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Number of completed calls.
    pub calls: u64,
    /// Total input tokens.
    pub input_tokens: u64,
    /// Total output tokens.
    pub output_tokens: u64,
}

/// Aggregated usage for a completion, keyed by model id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageSummary(BTreeMap<String, ModelUsage>);

impl UsageSummary {
    /// Create an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed call against a model.
    pub fn record(&mut self, model: &str, usage: &Usage) {
        let entry = self.0.entry(model.to_string()).or_default();
        entry.calls += 1;
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
    }

    /// Merge another summary into this one.
    pub fn merge(&mut self, other: &UsageSummary) {
        for (model, usage) in &other.0 {
            let entry = self.0.entry(model.clone()).or_default();
            entry.calls += usage.calls;
            entry.input_tokens += usage.input_tokens;
            entry.output_tokens += usage.output_tokens;
        }
    }

    /// Usage for a specific model, if any calls were recorded.
    pub fn get(&self, model: &str) -> Option<&ModelUsage> {
        self.0.get(model)
    }

    /// The model ids that appear in this summary.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|s| s.as_str())
    }

    /// Total tokens across all models.
    pub fn total_tokens(&self) -> u64 {
        self.0
            .values()
            .map(|u| u.input_tokens + u.output_tokens)
            .sum()
    }

    /// Total input tokens across all models.
    pub fn total_input_tokens(&self) -> u64 {
        self.0.values().map(|u| u.input_tokens).sum()
    }

    /// Total output tokens across all models.
    pub fn total_output_tokens(&self) -> u64 {
        self.0.values().map(|u| u.output_tokens).sum()
    }

    /// Total number of calls across all models.
    pub fn total_calls(&self) -> u64 {
        self.0.values().map(|u| u.calls).sum()
    }

    /// Whether no calls were recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Trace record for one child LM call served while a code block executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlmCall {
    /// Truncated preview of the prompt.
    pub prompt: String,
    /// The response text.
    pub response: String,
    /// Model id that served the call.
    pub model: String,
    /// Input tokens for this call.
    pub input_tokens: u64,
    /// Output tokens for this call.
    pub output_tokens: u64,
    /// Round-trip time in milliseconds.
    pub elapsed_ms: u64,
}

/// Result of executing one code block in an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error. Non-empty iff execution raised or the
    /// environment reported a failure.
    pub stderr: String,
    /// Preview of accessible bindings, name to string-coerced value.
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    /// Execution time in seconds.
    pub elapsed_secs: f64,
    /// Child LM calls served during this block, in served order.
    #[serde(default)]
    pub rlm_calls: Vec<RlmCall>,
}

impl ReplResult {
    /// Build a result that carries only an error explanation.
    pub fn from_stderr(message: impl Into<String>) -> Self {
        Self {
            stderr: message.into(),
            ..Default::default()
        }
    }

    /// Whether execution reported an error.
    pub fn is_err(&self) -> bool {
        !self.stderr.is_empty()
    }
}

/// A fenced executable region from one LM turn, with its execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// The source text of the region.
    pub code: String,
    /// The result, set exactly once after execution.
    pub result: ReplResult,
}

/// One LM turn: the raw response plus the execution of its code regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlmIteration {
    /// Zero-based turn index.
    pub index: usize,
    /// When the turn started.
    pub timestamp: DateTime<Utc>,
    /// Raw LM response text.
    pub response: String,
    /// Executed code blocks, in textual order.
    pub code_blocks: Vec<CodeBlock>,
    /// Final answer detected in this turn, if any.
    pub final_answer: Option<String>,
    /// Wall time for the whole turn in seconds.
    pub elapsed_secs: f64,
}

/// Why a completion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A final-answer sentinel was emitted.
    FinalAnswer,
    /// The iteration budget ran out.
    MaxIterations,
    /// The wall-clock budget ran out.
    WallClock,
    /// A per-call deadline expired.
    Timeout,
    /// The recursion-depth fallback path was taken.
    Fallback,
}

/// Metadata attached to a completed top-level call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    /// True when the completion exhausted a budget without a final answer.
    pub truncated: bool,
    /// True when the depth-limit fallback produced the answer.
    pub fallback: bool,
    /// Recursion depth this driver ran at.
    pub depth: u32,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Why the completion stopped.
    pub stop: StopReason,
}

/// The result of one top-level completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// The final answer text.
    pub response: String,
    /// Iteration records, in order.
    pub iterations: Vec<RlmIteration>,
    /// Aggregated usage across root and child calls.
    pub usage: UsageSummary,
    /// Completion metadata.
    pub metadata: CompletionMetadata,
}
