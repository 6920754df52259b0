//! The local executor: a persistent Python session on this host.
//!
//! State (namespace, context and history slots) lives for the lifetime of
//! the environment, which may span several top-level completions; each new
//! driver rebinds `llm_query` to its own handler via
//! `update_handler_address`.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::environment::Environment;
use crate::error::{Result, RlmError};
use crate::repl::{PythonSession, QueryTransport, SessionConfig};
use crate::types::{Message, ReplResult};

/// Configuration for the local executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Interpreter to spawn.
    pub python: String,
    /// Deadline in seconds for one snippet (covers nested LM calls).
    pub exec_timeout_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            exec_timeout_secs: 300,
        }
    }
}

impl LocalConfig {
    /// Build a config from the opaque `environment_kwargs` mapping.
    pub fn from_kwargs(kwargs: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(kwargs.clone())
            .map_err(|e| RlmError::Config(format!("invalid environment_kwargs: {}", e)))
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::new()
            .with_python(&self.python)
            .with_exec_timeout(Duration::from_secs(self.exec_timeout_secs))
    }
}

/// In-process executor with a persistent namespace.
pub struct LocalEnv {
    config: LocalConfig,
    handler_addr: SocketAddr,
    session: Option<PythonSession>,
}

impl LocalEnv {
    /// Create a local environment targeting the given handler address.
    ///
    /// The session is not spawned until `setup`.
    pub fn new(config: LocalConfig, handler_addr: SocketAddr) -> Self {
        Self {
            config,
            handler_addr,
            session: None,
        }
    }

    fn session_mut(&mut self) -> Result<&mut PythonSession> {
        self.session
            .as_mut()
            .ok_or_else(|| RlmError::Execution("environment not set up".to_string()))
    }
}

#[async_trait]
impl Environment for LocalEnv {
    async fn setup(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        if !PythonSession::is_available(&self.config.python).await {
            return Err(RlmError::Config(format!(
                "interpreter '{}' not available",
                self.config.python
            )));
        }
        let session = PythonSession::spawn(
            self.config.session_config(),
            QueryTransport::Tcp(self.handler_addr),
        )
        .await?;
        self.session = Some(session);
        Ok(())
    }

    async fn execute_code(&mut self, source: &str) -> Result<ReplResult> {
        match self.session_mut()?.execute(source).await {
            Ok(result) => Ok(result),
            Err(RlmError::Timeout(message)) => {
                // The timed-out session was killed; respawn so later blocks
                // still run, and report the loss through stderr.
                tracing::warn!(%message, "snippet deadline expired, restarting session");
                self.session = None;
                self.setup().await?;
                Ok(ReplResult::from_stderr(format!(
                    "{} (session restarted, namespace reset)",
                    message
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn load_context(&mut self, payload: &str, index: Option<usize>) -> Result<usize> {
        self.session_mut()?.load_context(payload, index).await
    }

    async fn add_history(&mut self, messages: &[Message], index: Option<usize>) -> Result<usize> {
        self.session_mut()?.add_history(messages, index).await
    }

    async fn context_count(&mut self) -> Result<usize> {
        Ok(self.session_mut()?.counts().await?.0)
    }

    async fn history_count(&mut self) -> Result<usize> {
        Ok(self.session_mut()?.counts().await?.1)
    }

    async fn update_handler_address(&mut self, addr: SocketAddr) -> Result<()> {
        self.handler_addr = addr;
        if let Some(session) = self.session.as_mut() {
            session.set_transport(QueryTransport::Tcp(addr)).await?;
        }
        Ok(())
    }

    fn supports_persistence(&self) -> bool {
        true
    }

    async fn teardown(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused_addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    async fn setup_or_skip(env: &mut LocalEnv) -> bool {
        if !PythonSession::is_available("python3").await {
            return false;
        }
        env.setup().await.unwrap();
        true
    }

    #[test]
    fn test_config_from_kwargs() {
        let kwargs = serde_json::json!({"python": "python3.12", "exec_timeout_secs": 10});
        let config = LocalConfig::from_kwargs(&kwargs).unwrap();
        assert_eq!(config.python, "python3.12");
        assert_eq!(config.exec_timeout_secs, 10);

        let config = LocalConfig::from_kwargs(&serde_json::json!({})).unwrap();
        assert_eq!(config.python, "python3");
    }

    #[tokio::test]
    async fn test_execute_and_persistence() {
        let mut env = LocalEnv::new(LocalConfig::default(), unused_addr());
        if !setup_or_skip(&mut env).await {
            return;
        }

        env.execute_code("total = 40").await.unwrap();
        let result = env.execute_code("print(total + 2)").await.unwrap();
        assert_eq!(result.stdout, "42\n");
        assert!(env.supports_persistence());

        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let mut env = LocalEnv::new(LocalConfig::default(), unused_addr());
        if !setup_or_skip(&mut env).await {
            return;
        }

        env.execute_code("x = 1").await.unwrap();
        env.setup().await.unwrap();
        let result = env.execute_code("print(x)").await.unwrap();
        assert_eq!(result.stdout, "1\n");

        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_slots_survive_handler_rebind() {
        let mut env = LocalEnv::new(LocalConfig::default(), unused_addr());
        if !setup_or_skip(&mut env).await {
            return;
        }

        let idx = env.load_context("payload", None).await.unwrap();
        assert_eq!(idx, 0);
        env.execute_code("marker = 'kept'").await.unwrap();

        let new_addr: SocketAddr = "127.0.0.1:2".parse().unwrap();
        env.update_handler_address(new_addr).await.unwrap();

        assert_eq!(env.context_count().await.unwrap(), 1);
        let result = env.execute_code("print(marker, context)").await.unwrap();
        assert_eq!(result.stdout, "kept payload\n");

        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_before_setup_fails() {
        let mut env = LocalEnv::new(LocalConfig::default(), unused_addr());
        let result = env.execute_code("print(1)").await;
        assert!(matches!(result, Err(RlmError::Execution(_))));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_config_error() {
        let config = LocalConfig {
            python: "definitely-not-a-python".to_string(),
            ..Default::default()
        };
        let mut env = LocalEnv::new(config, unused_addr());
        let result = env.setup().await;
        assert!(matches!(result, Err(RlmError::Config(_))));
    }
}
