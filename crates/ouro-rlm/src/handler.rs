//! The LM handler: a TCP request broker serving `llm_query` calls from
//! executing code.
//!
//! The handler binds an ephemeral loopback port, accepts connections
//! concurrently, and serves exactly one query/response exchange per
//! connection. Every served call is recorded against the code block the
//! driver marked active, under the same mutex that guards the usage
//! aggregate, so attribution stays atomic under concurrent accepts.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::backend::SharedBackend;
use crate::error::{Result, RlmError};
use crate::protocol::{Frame, read_message, write_message};
use crate::types::{PromptInput, RlmCall, Usage, UsageSummary};

/// Identifies a code block: (iteration index, block index).
pub type BlockTag = (usize, usize);

/// Grace period for draining in-flight connections at shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Preview length for recorded prompts.
const PROMPT_PREVIEW_LEN: usize = 200;

/// The result of routing one `llm_query` through the handler.
#[derive(Debug, Clone)]
pub struct SubcallOutcome {
    /// The response text returned to the caller.
    pub text: String,
    /// The model id recorded in the child trace entry.
    pub model: String,
    /// Token usage for this call (totals when the call fanned out).
    pub usage: Usage,
    /// Per-model usage to fold into the completion aggregate.
    pub summary: UsageSummary,
}

/// Routes queries arriving on the handler socket.
///
/// The driver installs either a plain route (one backend call) or a
/// recursive route (a sub-driver at depth + 1).
#[async_trait]
pub trait SubcallRouter: Send + Sync {
    async fn route(&self, prompt: PromptInput) -> Result<SubcallOutcome>;
}

/// A router that answers every query with a single plain backend call.
pub struct PlainRouter {
    backend: SharedBackend,
}

impl PlainRouter {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SubcallRouter for PlainRouter {
    async fn route(&self, prompt: PromptInput) -> Result<SubcallOutcome> {
        let outcome = self.backend.complete(&prompt).await?;
        let mut summary = UsageSummary::new();
        summary.record(&outcome.model, &outcome.usage);
        Ok(SubcallOutcome {
            text: outcome.text,
            model: outcome.model,
            usage: outcome.usage,
            summary,
        })
    }
}

#[derive(Default)]
struct HandlerState {
    active: Option<BlockTag>,
    calls: Vec<(Option<BlockTag>, RlmCall)>,
    usage: UsageSummary,
}

/// The LM request broker for one completion.
pub struct LmHandler {
    addr: SocketAddr,
    state: Arc<Mutex<HandlerState>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl LmHandler {
    /// Bind to an ephemeral loopback port and start accepting.
    pub async fn bind(router: Arc<dyn SubcallRouter>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(HandlerState::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            router,
            Arc::clone(&state),
            shutdown_rx,
        ));

        tracing::debug!(%addr, "LM handler bound");
        Ok(Self {
            addr,
            state,
            shutdown_tx,
            accept_task: Some(accept_task),
        })
    }

    /// The bound address, published to the environment.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Mark the code block that subsequent calls are attributed to.
    pub fn begin_block(&self, tag: BlockTag) {
        self.state.lock().unwrap().active = Some(tag);
    }

    /// Clear the active block and drain the calls recorded under it.
    pub fn finish_block(&self, tag: BlockTag) -> Vec<RlmCall> {
        let mut guard = self.state.lock().unwrap();
        guard.active = None;
        let mut collected = Vec::new();
        guard.calls.retain(|(call_tag, call)| {
            if *call_tag == Some(tag) {
                collected.push(call.clone());
                false
            } else {
                true
            }
        });
        collected
    }

    /// Snapshot of the usage aggregated from served calls.
    pub fn usage(&self) -> UsageSummary {
        self.state.lock().unwrap().usage.clone()
    }

    /// Stop accepting, drain in-flight connections, and release the port.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            task.await
                .map_err(|e| RlmError::Io(format!("handler accept loop failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for LmHandler {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<dyn SubcallRouter>,
    state: Arc<Mutex<HandlerState>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "handler connection accepted");
                    tasks.retain(|t| !t.is_finished());
                    tasks.push(tokio::spawn(handle_connection(
                        stream,
                        Arc::clone(&router),
                        Arc::clone(&state),
                    )));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "handler accept failed");
                }
            },
        }
    }

    // Port released as soon as the listener drops; in-flight exchanges get
    // a bounded grace period, then are hard-closed.
    drop(listener);
    let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
    if timeout(DRAIN_GRACE, join_all(tasks)).await.is_err() {
        tracing::warn!("handler drain grace expired, aborting in-flight connections");
        for abort in aborts {
            abort.abort();
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    router: Arc<dyn SubcallRouter>,
    state: Arc<Mutex<HandlerState>>,
) {
    let frame: Frame = match read_message(&mut stream).await {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "malformed frame on handler socket");
            let reply = Frame::Error {
                message: format!("protocol error: {}", e),
            };
            let _ = write_message(&mut stream, &reply).await;
            return;
        }
    };

    let prompt = match frame {
        Frame::Query { prompt } => prompt,
        _ => {
            let reply = Frame::Error {
                message: "expected a query frame".to_string(),
            };
            let _ = write_message(&mut stream, &reply).await;
            return;
        }
    };

    let start = Instant::now();
    match router.route(prompt.clone()).await {
        Ok(outcome) => {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            {
                let mut guard = state.lock().unwrap();
                let tag = guard.active;
                guard.calls.push((
                    tag,
                    RlmCall {
                        prompt: prompt.preview(PROMPT_PREVIEW_LEN),
                        response: outcome.text.clone(),
                        model: outcome.model.clone(),
                        input_tokens: outcome.usage.input_tokens,
                        output_tokens: outcome.usage.output_tokens,
                        elapsed_ms,
                    },
                ));
                guard.usage.merge(&outcome.summary);
            }
            let reply = Frame::Response {
                text: outcome.text,
                usage: Some(outcome.usage),
            };
            let _ = write_message(&mut stream, &reply).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "llm_query failed");
            let reply = Frame::Error {
                message: e.to_string(),
            };
            let _ = write_message(&mut stream, &reply).await;
        }
    }
}
