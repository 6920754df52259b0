//! The remote sandbox executor.
//!
//! Code is shipped to a sandbox broker over HTTP; a host-side poller
//! shuttles `llm_query` requests from the broker to the LM handler (over
//! the same framed TCP protocol local code uses, so usage and child-trace
//! accounting are identical) and posts responses back. When no broker URL
//! is configured, the environment hosts one in-process, which is the
//! development and test arrangement.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::{
    BrokerConfig, BrokerHandle, CountsReply, ExecuteBody, IndexReply, PendingReply, RespondBody,
    SlotBody,
};
use crate::environment::Environment;
use crate::error::{Result, RlmError};
use crate::protocol::{Frame, read_message, write_message};
use crate::types::{Message, PromptInput, ReplResult};

/// Configuration for the remote sandbox executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Broker base URL. When absent, a broker is hosted in-process.
    pub broker_url: Option<String>,
    /// Poll interval for `/pending`, in milliseconds.
    pub poll_interval_ms: u64,
    /// Deadline for one code submission round-trip, in seconds.
    pub request_timeout_secs: u64,
    /// Consecutive failures tolerated before escalating.
    pub unreachable_grace: u32,
    /// Treat sandbox loss as fatal once the grace is spent.
    pub fatal_on_unreachable: bool,
    /// Interpreter for a self-hosted broker.
    pub python: String,
    /// Snippet deadline for a self-hosted broker, in seconds.
    pub exec_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            poll_interval_ms: 100,
            request_timeout_secs: 330,
            unreachable_grace: 5,
            fatal_on_unreachable: false,
            python: "python3".to_string(),
            exec_timeout_secs: 300,
        }
    }
}

impl RemoteConfig {
    /// Build a config from the opaque `environment_kwargs` mapping.
    pub fn from_kwargs(kwargs: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(kwargs.clone())
            .map_err(|e| RlmError::Config(format!("invalid environment_kwargs: {}", e)))
    }
}

struct Poller {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Executor backed by a sandbox broker.
pub struct RemoteEnv {
    config: RemoteConfig,
    http: reqwest::Client,
    handler_addr: Arc<Mutex<SocketAddr>>,
    base_url: Option<String>,
    broker: Option<BrokerHandle>,
    poller: Option<Poller>,
    failures: u32,
}

impl RemoteEnv {
    /// Create a remote environment targeting the given handler address.
    ///
    /// Nothing is spawned or contacted until `setup`.
    pub fn new(config: RemoteConfig, handler_addr: SocketAddr) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            handler_addr: Arc::new(Mutex::new(handler_addr)),
            base_url: None,
            broker: None,
            poller: None,
            failures: 0,
        }
    }

    fn base_url(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .ok_or_else(|| RlmError::Execution("environment not set up".to_string()))
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    fn record_failure(&mut self, what: &str, error: impl std::fmt::Display) -> Result<ReplResult> {
        self.failures += 1;
        let message = format!("sandbox unreachable ({}): {}", what, error);
        tracing::warn!(failures = self.failures, %message, "sandbox request failed");
        if self.config.fatal_on_unreachable && self.failures > self.config.unreachable_grace {
            return Err(RlmError::SandboxUnreachable(message));
        }
        Ok(ReplResult::from_stderr(message))
    }

    async fn post_slot(&mut self, endpoint: &str, body: &SlotBody) -> Result<usize> {
        let url = format!("{}/{}", self.base_url()?, endpoint);
        let reply: IndexReply = self
            .http
            .post(url)
            .timeout(self.request_timeout())
            .json(body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| RlmError::Execution(e.to_string()))?
            .json()
            .await?;
        Ok(reply.index)
    }

    async fn fetch_counts(&mut self) -> Result<CountsReply> {
        let url = format!("{}/counts", self.base_url()?);
        let reply: CountsReply = self
            .http
            .get(url)
            .timeout(self.request_timeout())
            .send()
            .await?
            .error_for_status()
            .map_err(|e| RlmError::Execution(e.to_string()))?
            .json()
            .await?;
        Ok(reply)
    }
}

#[async_trait]
impl Environment for RemoteEnv {
    async fn setup(&mut self) -> Result<()> {
        if self.base_url.is_none() {
            match self.config.broker_url.clone() {
                Some(url) => self.base_url = Some(url.trim_end_matches('/').to_string()),
                None => {
                    let broker_config = BrokerConfig {
                        python: self.config.python.clone(),
                        exec_timeout: Duration::from_secs(self.config.exec_timeout_secs),
                        ..Default::default()
                    };
                    let broker =
                        crate::broker::serve(broker_config, "127.0.0.1:0".parse().unwrap())
                            .await?;
                    self.base_url = Some(broker.base_url().to_string());
                    self.broker = Some(broker);
                }
            }
        }

        let base = self.base_url()?.to_string();
        let health: serde_json::Value = self
            .http
            .get(format!("{}/health", base))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| RlmError::SandboxUnreachable(format!("health check failed: {}", e)))?
            .json()
            .await
            .map_err(|e| RlmError::SandboxUnreachable(format!("bad health reply: {}", e)))?;
        if health.get("status").and_then(|s| s.as_str()) != Some("ok") {
            return Err(RlmError::SandboxUnreachable(format!(
                "broker reported: {}",
                health
            )));
        }

        if self.poller.is_none() {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(poll_loop(
                self.http.clone(),
                base,
                Arc::clone(&self.handler_addr),
                Duration::from_millis(self.config.poll_interval_ms),
                shutdown_rx,
            ));
            self.poller = Some(Poller {
                shutdown_tx,
                task: Some(task),
            });
        }
        Ok(())
    }

    async fn execute_code(&mut self, source: &str) -> Result<ReplResult> {
        let url = format!("{}/execute", self.base_url()?);
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout())
            .json(&ExecuteBody {
                code: source.to_string(),
            })
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return self.record_failure("execute", e),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // The broker answered, so the sandbox is alive; the snippet or
            // its session failed.
            self.failures = 0;
            return Ok(ReplResult::from_stderr(format!(
                "sandbox execution failed (HTTP {}): {}",
                status, body
            )));
        }

        match response.json::<ReplResult>().await {
            Ok(result) => {
                self.failures = 0;
                Ok(result)
            }
            Err(e) => self.record_failure("execute decode", e),
        }
    }

    async fn load_context(&mut self, payload: &str, index: Option<usize>) -> Result<usize> {
        self.post_slot(
            "context",
            &SlotBody {
                payload: Some(payload.to_string()),
                messages: None,
                index,
            },
        )
        .await
    }

    async fn add_history(&mut self, messages: &[Message], index: Option<usize>) -> Result<usize> {
        self.post_slot(
            "history",
            &SlotBody {
                payload: None,
                messages: Some(messages.to_vec()),
                index,
            },
        )
        .await
    }

    async fn context_count(&mut self) -> Result<usize> {
        Ok(self.fetch_counts().await?.contexts)
    }

    async fn history_count(&mut self) -> Result<usize> {
        Ok(self.fetch_counts().await?.history)
    }

    async fn update_handler_address(&mut self, addr: SocketAddr) -> Result<()> {
        *self.handler_addr.lock().unwrap() = addr;
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        if let Some(poller) = self.poller.take() {
            let _ = poller.shutdown_tx.send(true);
            // Drop aborts the task if it does not exit promptly.
        }
        if let Some(broker) = self.broker.take() {
            broker.shutdown().await?;
        }
        self.base_url = None;
        Ok(())
    }
}

/// The host-side poll loop: fetch pending requests, serve each through the
/// LM handler, post the result back. Requests are served on their own
/// tasks so parallel `llm_query` calls in the sandbox do not serialize.
async fn poll_loop(
    http: reqwest::Client,
    base_url: String,
    handler_addr: Arc<Mutex<SocketAddr>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let reply = http
            .get(format!("{}/pending", base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        let pending: PendingReply = match reply {
            Ok(response) => match response.json().await {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(error = %e, "bad /pending reply");
                    continue;
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "poll failed");
                continue;
            }
        };

        let (Some(id), Some(prompt)) = (pending.id, pending.prompt) else {
            continue;
        };
        let addr = *handler_addr.lock().unwrap();
        let http = http.clone();
        let base_url = base_url.clone();
        tokio::spawn(async move {
            let body = match forward_to_handler(addr, &prompt).await {
                Ok(text) => RespondBody {
                    id,
                    text: Some(text),
                    error: None,
                },
                Err(e) => RespondBody {
                    id,
                    text: None,
                    error: Some(e.to_string()),
                },
            };
            if let Err(e) = http
                .post(format!("{}/respond", base_url))
                .json(&body)
                .send()
                .await
            {
                tracing::warn!(error = %e, "failed to deliver /respond");
            }
        });
    }
}

/// One framed query/response exchange with the LM handler.
async fn forward_to_handler(addr: SocketAddr, prompt: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let query = Frame::Query {
        prompt: PromptInput::Text(prompt.to_string()),
    };
    write_message(&mut stream, &query).await?;
    match read_message(&mut stream).await? {
        Frame::Response { text, .. } => Ok(text),
        Frame::Error { message } => Err(RlmError::Backend(message)),
        Frame::Query { .. } => Err(RlmError::Protocol(
            "handler sent a query frame".to_string(),
        )),
    }
}
