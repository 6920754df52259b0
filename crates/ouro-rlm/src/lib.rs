//! ouro-rlm: the recursive language model runtime.
//!
//! This crate provides a generic inference driver that lets a language
//! model decompose a prompt by emitting executable code which may, in
//! turn, call the same model recursively:
//! - Completion driver: the agent loop with iteration, wall-clock, and
//!   recursion-depth budgets
//! - LM handler: a length-prefixed TCP broker serving `llm_query` calls
//!   from executing code
//! - Execution environments: a persistent local executor and a remote
//!   sandbox executor driven by an HTTP poll broker
//! - Backend abstraction over LM providers

pub mod backend;
pub mod broker;
pub mod driver;
pub mod environment;
pub mod error;
pub mod handler;
pub mod local;
pub mod openai;
pub mod parser;
pub mod prompts;
pub mod protocol;
pub mod remote;
pub mod repl;
pub mod types;

pub use backend::{
    CompletionOutcome, LmBackend, LoggingBackend, MockBackend, SharedBackend, create_backend,
    with_retry,
};
pub use broker::{BrokerConfig, BrokerHandle};
pub use driver::{Rlm, RlmConfig};
pub use environment::{Environment, create_environment};
pub use error::{Result, RlmError};
pub use handler::{BlockTag, LmHandler, PlainRouter, SubcallOutcome, SubcallRouter};
pub use local::{LocalConfig, LocalEnv};
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use parser::{FinalAnswer, ParsedResponse, parse_response};
pub use prompts::CORE_BEHAVIOR;
pub use protocol::{Frame, decode_message, encode_message, read_message, write_message};
pub use remote::{RemoteConfig, RemoteEnv};
pub use repl::{PythonSession, QueryTransport, SessionConfig};
pub use types::{
    ChatCompletion, CodeBlock, CompletionMetadata, Message, ModelUsage, PromptInput, ReplResult,
    RlmCall, RlmIteration, Role, StopReason, Usage, UsageSummary,
};
