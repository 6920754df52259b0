//! The sandbox-side HTTP broker.
//!
//! Code running inside the sandbox calls `llm_query`, which POSTs to
//! `/enqueue` and blocks (bounded) until the host poller fetches the
//! request from `/pending`, serves it through the LM handler, and delivers
//! the result to `/respond`. The broker also accepts code submissions on
//! `/execute` and slot bindings on `/context` / `/history`, backed by the
//! same persistent Python session the local executor uses.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::{Result, RlmError};
use crate::repl::{PythonSession, QueryTransport, SessionConfig};
use crate::types::{Message, ReplResult};

/// Configuration for the broker app.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bounded wait for `/enqueue` before it fails the caller.
    pub enqueue_timeout: Duration,
    /// Interpreter for the execution session.
    pub python: String,
    /// Deadline for one snippet.
    pub exec_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_secs(120),
            python: "python3".to_string(),
            exec_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueBody {
    pub prompt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondBody {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteBody {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SlotBody {
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
    #[serde(default)]
    pub index: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexReply {
    pub index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountsReply {
    pub contexts: usize,
    pub history: usize,
}

struct PendingQuery {
    id: String,
    prompt: String,
}

struct BrokerState {
    config: BrokerConfig,
    base_url: String,
    session: tokio::sync::Mutex<Option<PythonSession>>,
    queue: Mutex<VecDeque<PendingQuery>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<EnqueueReply>>>,
}

impl BrokerState {
    async fn session_reply<T, F>(&self, op: F) -> std::result::Result<T, (StatusCode, String)>
    where
        F: AsyncFnOnce(&mut PythonSession) -> Result<T>,
    {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let config = SessionConfig::new()
                .with_python(&self.config.python)
                .with_exec_timeout(self.config.exec_timeout);
            let session =
                PythonSession::spawn(config, QueryTransport::Http(self.base_url.clone()))
                    .await
                    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            *guard = Some(session);
        }
        let session = guard.as_mut().expect("session just ensured");
        match op(session).await {
            Ok(value) => Ok(value),
            Err(RlmError::Timeout(message)) => {
                // The timed-out session was killed; drop it so the next
                // submission starts fresh.
                *guard = None;
                Err((StatusCode::REQUEST_TIMEOUT, message))
            }
            Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        }
    }
}

/// A running broker and its bound address.
pub struct BrokerHandle {
    addr: SocketAddr,
    base_url: String,
    state: Arc<BrokerState>,
    shutdown_tx: watch::Sender<bool>,
    serve_task: Option<JoinHandle<std::io::Result<()>>>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop serving and release the execution session.
    ///
    /// Graceful shutdown can be held open by a blocked `/enqueue`
    /// long-poll, so the wait is bounded.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut task) = self.serve_task.take() {
            if timeout(Duration::from_secs(5), &mut task).await.is_err() {
                tracing::warn!("broker did not drain in time, aborting");
                task.abort();
            }
        }
        if let Some(session) = self.state.session.lock().await.take() {
            session.shutdown().await?;
        }
        Ok(())
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
    }
}

/// Bind and serve the broker app.
pub async fn serve(config: BrokerConfig, bind_addr: SocketAddr) -> Result<BrokerHandle> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    let base_url = format!("http://{}", addr);

    let state = Arc::new(BrokerState {
        config,
        base_url: base_url.clone(),
        session: tokio::sync::Mutex::new(None),
        queue: Mutex::new(VecDeque::new()),
        waiters: Mutex::new(HashMap::new()),
    });

    let app = router(Arc::clone(&state));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let serve_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    tracing::debug!(%addr, "sandbox broker bound");
    Ok(BrokerHandle {
        addr,
        base_url,
        state,
        shutdown_tx,
        serve_task: Some(serve_task),
    })
}

fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/enqueue", post(enqueue))
        .route("/pending", get(pending))
        .route("/respond", post(respond))
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/context", post(context))
        .route("/history", post(history))
        .route("/counts", get(counts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn enqueue(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<EnqueueBody>,
) -> Json<EnqueueReply> {
    let id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    state.waiters.lock().unwrap().insert(id.clone(), tx);
    state.queue.lock().unwrap().push_back(PendingQuery {
        id: id.clone(),
        prompt: body.prompt,
    });

    match timeout(state.config.enqueue_timeout, rx).await {
        Ok(Ok(reply)) => Json(reply),
        _ => {
            state.waiters.lock().unwrap().remove(&id);
            state.queue.lock().unwrap().retain(|p| p.id != id);
            Json(EnqueueReply {
                text: None,
                error: Some("llm_query timed out waiting for the host".to_string()),
            })
        }
    }
}

async fn pending(State(state): State<Arc<BrokerState>>) -> Json<PendingReply> {
    match state.queue.lock().unwrap().pop_front() {
        Some(query) => Json(PendingReply {
            id: Some(query.id),
            prompt: Some(query.prompt),
        }),
        None => Json(PendingReply::default()),
    }
}

async fn respond(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<RespondBody>,
) -> StatusCode {
    let waiter = state.waiters.lock().unwrap().remove(&body.id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(EnqueueReply {
                text: body.text,
                error: body.error,
            });
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn health(State(state): State<Arc<BrokerState>>) -> Json<serde_json::Value> {
    let pending = state.queue.lock().unwrap().len();
    let waiting = state.waiters.lock().unwrap().len();
    Json(serde_json::json!({
        "status": "ok",
        "pending": pending,
        "waiting": waiting,
    }))
}

async fn execute(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<ExecuteBody>,
) -> std::result::Result<Json<ReplResult>, (StatusCode, String)> {
    let result = state
        .session_reply(async |session| session.execute(&body.code).await)
        .await?;
    Ok(Json(result))
}

async fn context(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<SlotBody>,
) -> std::result::Result<Json<IndexReply>, (StatusCode, String)> {
    let payload = body
        .payload
        .ok_or((StatusCode::BAD_REQUEST, "missing payload".to_string()))?;
    let index = state
        .session_reply(async |session| session.load_context(&payload, body.index).await)
        .await?;
    Ok(Json(IndexReply { index }))
}

async fn history(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<SlotBody>,
) -> std::result::Result<Json<IndexReply>, (StatusCode, String)> {
    let messages = body
        .messages
        .ok_or((StatusCode::BAD_REQUEST, "missing messages".to_string()))?;
    let index = state
        .session_reply(async |session| session.add_history(&messages, body.index).await)
        .await?;
    Ok(Json(IndexReply { index }))
}

async fn counts(
    State(state): State<Arc<BrokerState>>,
) -> std::result::Result<Json<CountsReply>, (StatusCode, String)> {
    let (contexts, history) = state
        .session_reply(async |session| session.counts().await)
        .await?;
    Ok(Json(CountsReply { contexts, history }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serve_test_broker() -> BrokerHandle {
        serve(BrokerConfig::default(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let broker = serve_test_broker().await;
        let client = reqwest::Client::new();

        let reply: serde_json::Value = client
            .get(format!("{}/health", broker.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["pending"], 0);

        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_empty_reply_is_empty_object() {
        let broker = serve_test_broker().await;
        let client = reqwest::Client::new();

        let text = client
            .get(format!("{}/pending", broker.base_url()))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text, "{}");

        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_pending_respond_cycle() {
        let broker = serve_test_broker().await;
        let base = broker.base_url().to_string();
        let client = reqwest::Client::new();

        // The enqueue blocks, so run it on its own task.
        let enqueue_base = base.clone();
        let enqueue_task = tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("{}/enqueue", enqueue_base))
                .json(&EnqueueBody {
                    prompt: "spell DOG".to_string(),
                })
                .send()
                .await
                .unwrap()
                .json::<EnqueueReply>()
                .await
                .unwrap()
        });

        // Poll until the request shows up.
        let pending = loop {
            let reply: PendingReply = client
                .get(format!("{}/pending", base))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if reply.id.is_some() {
                break reply;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(pending.prompt.as_deref(), Some("spell DOG"));

        let status = client
            .post(format!("{}/respond", base))
            .json(&RespondBody {
                id: pending.id.unwrap(),
                text: Some("D-O-G".to_string()),
                error: None,
            })
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::OK);

        let reply = enqueue_task.await.unwrap();
        assert_eq!(reply.text.as_deref(), Some("D-O-G"));
        assert!(reply.error.is_none());

        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_respond_unknown_id_is_not_found() {
        let broker = serve_test_broker().await;
        let client = reqwest::Client::new();

        let status = client
            .post(format!("{}/respond", broker.base_url()))
            .json(&RespondBody {
                id: "no-such-id".to_string(),
                text: Some("x".to_string()),
                error: None,
            })
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_times_out_without_poller() {
        let config = BrokerConfig {
            enqueue_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let broker = serve(config, "127.0.0.1:0".parse().unwrap()).await.unwrap();

        let reply: EnqueueReply = reqwest::Client::new()
            .post(format!("{}/enqueue", broker.base_url()))
            .json(&EnqueueBody {
                prompt: "anyone there?".to_string(),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(reply.error.unwrap().contains("timed out"));

        // The abandoned request is gone from the queue.
        let pending: PendingReply = reqwest::Client::new()
            .get(format!("{}/pending", broker.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(pending.id.is_none());

        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_runs_code() {
        if !PythonSession::is_available("python3").await {
            return;
        }
        let broker = serve_test_broker().await;

        let result: ReplResult = reqwest::Client::new()
            .post(format!("{}/execute", broker.base_url()))
            .json(&ExecuteBody {
                code: "print(6 * 7)".to_string(),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(result.stdout, "42\n");

        broker.shutdown().await.unwrap();
    }
}
