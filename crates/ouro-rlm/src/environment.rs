//! The execution environment abstraction.
//!
//! An environment accepts snippets and returns structured results. Two
//! realizations exist: the local executor (`LocalEnv`, persistent
//! in-process session) and the remote sandbox executor (`RemoteEnv`,
//! HTTP broker + poller).

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::{Result, RlmError};
use crate::local::{LocalConfig, LocalEnv};
use crate::remote::{RemoteConfig, RemoteEnv};
use crate::types::{Message, ReplResult};

/// An execution environment for one or more completions.
///
/// `setup` must be idempotent: drivers call it whenever they take
/// ownership of an environment, including a persistent one that was set
/// up by an earlier driver.
#[async_trait]
pub trait Environment: Send {
    /// Prepare the environment for execution.
    async fn setup(&mut self) -> Result<()>;

    /// Execute a snippet and return its structured result.
    ///
    /// Errors raised by the snippet itself are reported via
    /// `ReplResult::stderr`, not as `Err`.
    async fn execute_code(&mut self, source: &str) -> Result<ReplResult>;

    /// Bind a context payload; returns the assigned slot index.
    async fn load_context(&mut self, payload: &str, index: Option<usize>) -> Result<usize>;

    /// Bind a history slot; returns the assigned index.
    async fn add_history(&mut self, messages: &[Message], index: Option<usize>) -> Result<usize>;

    /// Number of bound context slots.
    async fn context_count(&mut self) -> Result<usize>;

    /// Number of bound history slots.
    async fn history_count(&mut self) -> Result<usize>;

    /// Rebind the `llm_query` helper to a new handler address without
    /// losing state.
    async fn update_handler_address(&mut self, addr: SocketAddr) -> Result<()>;

    /// Whether slots and namespace survive across top-level calls.
    fn supports_persistence(&self) -> bool {
        false
    }

    /// Release all resources. Further calls are undefined.
    async fn teardown(&mut self) -> Result<()>;
}

/// Create an environment from its configuration id.
///
/// `kwargs` is the opaque `environment_kwargs` mapping from the driver
/// configuration. The `setup_code` key is handled by the driver, not here.
pub fn create_environment(
    id: &str,
    kwargs: &serde_json::Value,
    handler_addr: SocketAddr,
) -> Result<Box<dyn Environment>> {
    match id {
        "local" => {
            let config = LocalConfig::from_kwargs(kwargs)?;
            Ok(Box::new(LocalEnv::new(config, handler_addr)))
        }
        "sandbox" => {
            let config = RemoteConfig::from_kwargs(kwargs)?;
            Ok(Box::new(RemoteEnv::new(config, handler_addr)))
        }
        other => Err(RlmError::Config(format!("unknown environment '{}'", other))),
    }
}

/// Extract the optional `setup_code` snippet from environment kwargs.
pub fn setup_code(kwargs: &serde_json::Value) -> Option<&str> {
    kwargs.get("setup_code").and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_environment_unknown_id() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = create_environment("mars", &serde_json::json!({}), addr);
        assert!(matches!(result, Err(RlmError::Config(_))));
    }

    #[test]
    fn test_create_local_environment() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let env = create_environment("local", &serde_json::json!({}), addr).unwrap();
        assert!(env.supports_persistence());
    }

    #[test]
    fn test_setup_code_extraction() {
        let kwargs = serde_json::json!({"setup_code": "import math"});
        assert_eq!(setup_code(&kwargs), Some("import math"));
        assert_eq!(setup_code(&serde_json::json!({})), None);
    }
}
