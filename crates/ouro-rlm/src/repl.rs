//! Long-lived Python session driven over framed stdio.
//!
//! The session is the execution engine behind the local environment and the
//! sandbox broker. A `python3` child runs an embedded driver that owns a
//! persistent namespace, injects the synchronous `llm_query` helper, and
//! answers commands (execute, slot binding, transport rebinding) with the
//! same length-prefixed JSON framing used on the handler socket.
//!
//! Values crossing the boundary are restricted to JSON-compatible data;
//! namespace bindings are reported as string previews truncated to a fixed
//! width.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use crate::error::{Result, RlmError};
use crate::protocol::{read_message, write_message};
use crate::types::{Message, ReplResult};

/// Where the in-session `llm_query` helper sends its queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTransport {
    /// Framed TCP to the LM handler.
    Tcp(SocketAddr),
    /// HTTP POST to a sandbox broker's `/enqueue`.
    Http(String),
    /// No handler configured; `llm_query` raises.
    None,
}

impl QueryTransport {
    fn as_spec(&self) -> String {
        match self {
            QueryTransport::Tcp(addr) => format!("tcp:{}", addr),
            QueryTransport::Http(url) => format!("http:{}", url),
            QueryTransport::None => "none".to_string(),
        }
    }
}

/// Configuration for a Python session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interpreter to spawn.
    pub python: String,
    /// Deadline for one `exec` round-trip (covers nested LM calls).
    pub exec_timeout: Duration,
    /// Width of namespace binding previews.
    pub preview_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            exec_timeout: Duration::from_secs(300),
            preview_len: 120,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum SessionCommand<'a> {
    Exec {
        code: &'a str,
    },
    LoadContext {
        payload: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    AddHistory {
        messages: &'a [Message],
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    SetTransport {
        transport: String,
    },
    Counts,
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SessionReply {
    Exec {
        stdout: String,
        stderr: String,
        bindings: BTreeMap<String, String>,
        elapsed_secs: f64,
    },
    Index {
        index: usize,
    },
    Counts {
        contexts: usize,
        history: usize,
    },
    Ok,
    Error {
        message: String,
    },
}

/// A running Python child and its framed command pipe.
pub struct PythonSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    config: SessionConfig,
}

impl PythonSession {
    /// Spawn the interpreter with the embedded driver.
    pub async fn spawn(config: SessionConfig, transport: QueryTransport) -> Result<Self> {
        let mut child = Command::new(&config.python)
            .arg("-c")
            .arg(PYTHON_DRIVER)
            .arg(transport.as_spec())
            .arg(config.preview_len.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RlmError::Execution(format!("failed to spawn {}: {}", config.python, e))
            })?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));

        Ok(Self {
            child,
            stdin,
            stdout,
            config,
        })
    }

    /// Check whether the interpreter can be spawned at all.
    pub async fn is_available(python: &str) -> bool {
        Command::new(python)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn round_trip(&mut self, command: &SessionCommand<'_>) -> Result<SessionReply> {
        write_message(&mut self.stdin, command).await?;
        read_message(&mut self.stdout).await
    }

    /// Execute a snippet in the persistent namespace.
    ///
    /// Exceptions inside the snippet are captured into stderr by the driver;
    /// an `Err` here means the session itself failed (dead child, deadline).
    pub async fn execute(&mut self, code: &str) -> Result<ReplResult> {
        let deadline = self.config.exec_timeout;
        let reply = match timeout(deadline, self.round_trip(&SessionCommand::Exec { code })).await
        {
            Ok(reply) => reply?,
            Err(_) => {
                // The snippet is still running; the session is unusable.
                let _ = self.child.start_kill();
                return Err(RlmError::Timeout(format!(
                    "code execution exceeded {:?}",
                    deadline
                )));
            }
        };

        match reply {
            SessionReply::Exec {
                stdout,
                stderr,
                bindings,
                elapsed_secs,
            } => Ok(ReplResult {
                stdout,
                stderr,
                bindings,
                elapsed_secs,
                rlm_calls: Vec::new(),
            }),
            SessionReply::Error { message } => Err(RlmError::Execution(message)),
            other => Err(RlmError::Protocol(format!(
                "unexpected session reply: {:?}",
                other
            ))),
        }
    }

    /// Bind a context payload, returning the assigned slot index.
    pub async fn load_context(&mut self, payload: &str, index: Option<usize>) -> Result<usize> {
        match self
            .round_trip(&SessionCommand::LoadContext { payload, index })
            .await?
        {
            SessionReply::Index { index } => Ok(index),
            SessionReply::Error { message } => Err(RlmError::Execution(message)),
            other => Err(RlmError::Protocol(format!(
                "unexpected session reply: {:?}",
                other
            ))),
        }
    }

    /// Bind a history slot, returning the assigned index.
    pub async fn add_history(
        &mut self,
        messages: &[Message],
        index: Option<usize>,
    ) -> Result<usize> {
        match self
            .round_trip(&SessionCommand::AddHistory { messages, index })
            .await?
        {
            SessionReply::Index { index } => Ok(index),
            SessionReply::Error { message } => Err(RlmError::Execution(message)),
            other => Err(RlmError::Protocol(format!(
                "unexpected session reply: {:?}",
                other
            ))),
        }
    }

    /// Current slot counts: (contexts, history).
    pub async fn counts(&mut self) -> Result<(usize, usize)> {
        match self.round_trip(&SessionCommand::Counts).await? {
            SessionReply::Counts { contexts, history } => Ok((contexts, history)),
            other => Err(RlmError::Protocol(format!(
                "unexpected session reply: {:?}",
                other
            ))),
        }
    }

    /// Retarget `llm_query` without touching the namespace.
    pub async fn set_transport(&mut self, transport: QueryTransport) -> Result<()> {
        match self
            .round_trip(&SessionCommand::SetTransport {
                transport: transport.as_spec(),
            })
            .await?
        {
            SessionReply::Ok => Ok(()),
            SessionReply::Error { message } => Err(RlmError::Execution(message)),
            other => Err(RlmError::Protocol(format!(
                "unexpected session reply: {:?}",
                other
            ))),
        }
    }

    /// Ask the driver to exit and reap the child.
    pub async fn shutdown(mut self) -> Result<()> {
        if self
            .round_trip(&SessionCommand::Shutdown)
            .await
            .is_err()
        {
            let _ = self.child.start_kill();
        }
        let _ = timeout(Duration::from_secs(2), self.child.wait()).await;
        Ok(())
    }
}

/// The driver program run inside the interpreter.
const PYTHON_DRIVER: &str = r##"
import io
import json
import socket
import struct
import sys
import time
import traceback
import urllib.request

_OUT = sys.stdout.buffer
_IN = sys.stdin.buffer
_TRANSPORT_SPEC = sys.argv[1] if len(sys.argv) > 1 else "none"
_PREVIEW = int(sys.argv[2]) if len(sys.argv) > 2 else 120


def _recv_exact(sock, n):
    buf = b""
    while len(buf) < n:
        chunk = sock.recv(n - len(buf))
        if not chunk:
            raise ConnectionError("handler closed the connection")
        buf += chunk
    return buf


def _read_frame():
    header = _IN.read(4)
    if len(header) < 4:
        return None
    (length,) = struct.unpack(">I", header)
    payload = _IN.read(length)
    if len(payload) < length:
        return None
    return json.loads(payload.decode("utf-8"))


def _write_frame(obj):
    payload = json.dumps(obj).encode("utf-8")
    _OUT.write(struct.pack(">I", len(payload)) + payload)
    _OUT.flush()


def _parse_transport(spec):
    kind, _, rest = spec.partition(":")
    if kind == "tcp":
        host, _, port = rest.rpartition(":")
        return ("tcp", host, int(port))
    if kind == "http":
        return ("http", rest)
    return ("none",)


_target = _parse_transport(_TRANSPORT_SPEC)


def _query_tcp(host, port, prompt):
    with socket.create_connection((host, port)) as sock:
        payload = json.dumps({"kind": "query", "prompt": prompt}).encode("utf-8")
        sock.sendall(struct.pack(">I", len(payload)) + payload)
        (length,) = struct.unpack(">I", _recv_exact(sock, 4))
        reply = json.loads(_recv_exact(sock, length).decode("utf-8"))
    if reply.get("kind") == "response":
        return reply.get("text", "")
    raise RuntimeError(reply.get("message", "llm_query failed"))


def _query_http(base, prompt):
    body = json.dumps({"prompt": prompt}).encode("utf-8")
    request = urllib.request.Request(
        base.rstrip("/") + "/enqueue",
        data=body,
        headers={"Content-Type": "application/json"},
    )
    with urllib.request.urlopen(request, timeout=600) as response:
        reply = json.loads(response.read().decode("utf-8"))
    if reply.get("error"):
        raise RuntimeError(reply["error"])
    return reply.get("text", "")


def llm_query(prompt):
    if _target[0] == "tcp":
        return _query_tcp(_target[1], _target[2], prompt)
    if _target[0] == "http":
        return _query_http(_target[1], prompt)
    raise RuntimeError("no LM handler configured")


_namespace = {"llm_query": llm_query}
_contexts = []
_histories = []


def _preview(value):
    try:
        text = repr(value)
    except Exception:
        return "<unprintable>"
    if len(text) > _PREVIEW:
        return text[:_PREVIEW] + "..."
    return text


def _bindings():
    out = {}
    for name, value in _namespace.items():
        if name.startswith("_") or callable(value):
            continue
        if isinstance(value, type(sys)):
            continue
        out[name] = _preview(value)
    return out


def _bind_slot(slots, prefix, value, index):
    if index is None:
        index = len(slots)
    while len(slots) <= index:
        slots.append(None)
    slots[index] = value
    _namespace["%s_%d" % (prefix, index)] = value
    if prefix == "context" and index == 0:
        _namespace["context"] = value
    return index


def _run(code):
    out, err = io.StringIO(), io.StringIO()
    old_out, old_err = sys.stdout, sys.stderr
    sys.stdout, sys.stderr = out, err
    started = time.monotonic()
    try:
        exec(compile(code, "<rlm>", "exec"), _namespace)
    except BaseException:
        traceback.print_exc(limit=8, file=err)
    finally:
        sys.stdout, sys.stderr = old_out, old_err
    return {
        "status": "exec",
        "stdout": out.getvalue(),
        "stderr": err.getvalue(),
        "bindings": _bindings(),
        "elapsed_secs": time.monotonic() - started,
    }


while True:
    message = _read_frame()
    if message is None:
        break
    op = message.get("op")
    try:
        if op == "exec":
            _write_frame(_run(message.get("code", "")))
        elif op == "load_context":
            slot = _bind_slot(
                _contexts, "context", message.get("payload", ""), message.get("index")
            )
            _write_frame({"status": "index", "index": slot})
        elif op == "add_history":
            slot = _bind_slot(
                _histories, "history", message.get("messages", []), message.get("index")
            )
            _write_frame({"status": "index", "index": slot})
        elif op == "set_transport":
            _target = _parse_transport(message.get("transport", "none"))
            _write_frame({"status": "ok"})
        elif op == "counts":
            _write_frame(
                {
                    "status": "counts",
                    "contexts": len(_contexts),
                    "history": len(_histories),
                }
            )
        elif op == "shutdown":
            _write_frame({"status": "ok"})
            break
        else:
            _write_frame({"status": "error", "message": "unknown op: %r" % (op,)})
    except Exception as exc:
        _write_frame({"status": "error", "message": str(exc)})
"##;
