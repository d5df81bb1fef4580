//! Bidirectional JSON-RPC pump over one agent child's stdio.
//!
//! One transport owns one child process, one writer task, and one reader
//! task. Outbound calls allocate monotone numeric ids and park a oneshot
//! waiter in the pending-call table; the reader resolves waiters as
//! responses arrive, in whatever order the agent produces them. Inbound
//! frames that carry both `id` and `method` are agent-initiated requests:
//! they are handed to the owner through the inbound channel together with a
//! [`Responder`] whose reply travels through the same writer task as
//! outbound calls, so a request handler may issue further outbound calls
//! without deadlocking the pump.
//!
//! The transport has no timeouts of its own; callers bring cancellation
//! tokens. It stops — failing every pending call — on child exit, stream
//! I/O error, or a frame that is not JSON-RPC.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::config::AgentCommand;
use crate::{AppError, Result};

/// Environment variables inherited by spawned agent processes.
///
/// Everything else is stripped via `env_clear()` so supervisor-side secrets
/// never reach the child's environment.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "TERM",
    "RUST_LOG",
    // Windows equivalents.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Outbound channel depth; writes are serialized through one task.
const OUTBOUND_BUFFER: usize = 64;
/// Inbound channel depth between the reader and the dispatch loop.
const INBOUND_BUFFER: usize = 256;

/// Waiters for outbound calls, keyed by JSON-RPC id.
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// One frame the reader handed to the transport's owner.
#[derive(Debug)]
pub enum Inbound {
    /// Agent-initiated request; reply through the [`Responder`].
    Request {
        /// JSON-RPC request id, echoed back verbatim in the reply.
        id: Value,
        /// Method name.
        method: String,
        /// Method parameters.
        params: Value,
        /// Reply handle routed through the writer task.
        responder: Responder,
    },
    /// Agent notification; no reply expected.
    Notification {
        /// Method name.
        method: String,
        /// Notification parameters.
        params: Value,
    },
    /// The transport stopped; no further frames will arrive.
    Closed {
        /// Why the transport stopped.
        reason: String,
    },
}

/// Reply handle for one inbound request.
#[derive(Debug)]
pub struct Responder {
    id: Value,
    outbound: mpsc::Sender<Value>,
}

impl Responder {
    /// Send a success result back to the agent.
    pub async fn ok(self, result: Value) {
        let msg = json!({ "jsonrpc": "2.0", "id": self.id, "result": result });
        if self.outbound.send(msg).await.is_err() {
            debug!("transport writer gone before inbound-request reply");
        }
    }

    /// Send a JSON-RPC error back to the agent.
    pub async fn error(self, code: i64, message: &str) {
        let msg = json!({
            "jsonrpc": "2.0",
            "id": self.id,
            "error": { "code": code, "message": message },
        });
        if self.outbound.send(msg).await.is_err() {
            debug!("transport writer gone before inbound-request error reply");
        }
    }
}

/// Bidirectional JSON-RPC 2.0 transport over newline-delimited JSON.
pub struct AcpTransport {
    label: String,
    outbound_tx: mpsc::Sender<Value>,
    pending: PendingMap,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    child: Mutex<Option<Child>>,
    delivered: Arc<AtomicU64>,
}

impl AcpTransport {
    /// Spawn an agent child process and pump its stdio.
    ///
    /// The child starts in `cwd` with a cleared environment plus the
    /// [`ALLOWED_ENV_VARS`] allowlist, and is killed if the transport is
    /// dropped. Its stderr is drained to `debug!` logs. The ACP
    /// `initialize` handshake is the caller's responsibility.
    ///
    /// Returns the transport and the inbound frame channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when the executable cannot be launched or
    /// its stdio handles cannot be captured.
    pub fn spawn_process(
        command: &AgentCommand,
        cwd: &Path,
        label: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        cmd.current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Spawn(format!("failed to spawn {}: {err}", command.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let stderr_label = label.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(transport = %stderr_label, line = %line, "agent stderr");
                    }
                }
            });
        }

        let (transport, inbound_rx) = Self::over_streams(stdout, stdin, label);
        *transport.child.try_lock().map_err(|_| {
            AppError::Spawn("freshly built transport child slot contended".into())
        })? = Some(child);

        Ok((transport, inbound_rx))
    }

    /// Pump an arbitrary reader/writer pair instead of a child's stdio.
    ///
    /// This is how embedding code and tests drive the transport over
    /// in-memory duplex streams; [`Self::stop`] then has no process to
    /// terminate.
    pub fn over_streams<R, W>(reader: R, writer: W, label: &str) -> (Arc<Self>, mpsc::Receiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let delivered = Arc::new(AtomicU64::new(0));

        let transport = Arc::new(Self {
            label: label.to_owned(),
            outbound_tx: outbound_tx.clone(),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            running: Arc::clone(&running),
            cancel: cancel.clone(),
            child: Mutex::new(None),
            delivered: Arc::clone(&delivered),
        });

        tokio::spawn(run_writer(
            writer,
            outbound_rx,
            Arc::clone(&running),
            cancel.clone(),
            transport.label.clone(),
        ));
        tokio::spawn(run_reader(
            reader,
            inbound_tx,
            outbound_tx,
            pending,
            running,
            cancel,
            delivered,
            transport.label.clone(),
        ));

        (transport, inbound_rx)
    }

    /// Number of inbound frames handed to the inbound channel so far.
    ///
    /// Responses resolve waiters directly and are not counted. Consumers
    /// that need "everything the agent sent before this response has been
    /// dispatched" can capture this after a call resolves and wait for
    /// their dispatch loop to catch up to it.
    #[must_use]
    pub fn delivered_seq(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Whether the pump is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Issue an outbound call and wait for its response.
    ///
    /// # Errors
    ///
    /// - `AppError::Acp` — transport not running, writer gone, or stream
    ///   closed before the response arrived.
    /// - `AppError::Protocol` — the agent answered with a JSON-RPC error.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let never = CancellationToken::new();
        self.request_with_cancel(method, params, &never).await
    }

    /// Issue an outbound call that the caller can abandon.
    ///
    /// On cancellation the waiter is released with `AppError::Cancelled`
    /// and the id is forgotten; a late response is dropped by the reader.
    ///
    /// # Errors
    ///
    /// As [`Self::request`], plus `AppError::Cancelled` when `cancel` fires
    /// first.
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if !self.is_running() {
            return Err(AppError::Acp(format!(
                "transport {} is not running",
                self.label
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if self.outbound_tx.send(msg).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AppError::Acp(format!(
                "transport {} writer closed before {method} was sent",
                self.label
            )));
        }

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(AppError::Cancelled(format!("{method} call cancelled")))
            }

            res = rx => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(AppError::Acp(format!(
                    "transport {} closed while awaiting {method} response",
                    self.label
                ))),
            }
        }
    }

    /// Send a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` when the transport is not running.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if !self.is_running() {
            return Err(AppError::Acp(format!(
                "transport {} is not running",
                self.label
            )));
        }
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.outbound_tx.send(msg).await.map_err(|_| {
            AppError::Acp(format!(
                "transport {} writer closed before {method} was sent",
                self.label
            ))
        })
    }

    /// Stop the pump and terminate the child.
    ///
    /// Closes the child's stdin (by stopping the writer), fails every
    /// pending call, waits up to `grace` for a voluntary exit, then kills.
    /// Idempotent.
    pub async fn stop(&self, grace: Duration) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        fail_pending(&self.pending, "transport stopped").await;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(transport = %self.label, ?status, "agent exited within grace period");
                }
                Ok(Err(err)) => {
                    warn!(transport = %self.label, %err, "error waiting for agent exit");
                }
                Err(_) => {
                    warn!(transport = %self.label, "agent did not exit within grace period, killing");
                    if let Err(err) = child.kill().await {
                        warn!(transport = %self.label, %err, "failed to kill agent");
                    }
                }
            }
        }
    }
}

/// Writer task: serialize each outbound value as one `\n`-terminated line.
///
/// Exits on cancellation (dropping the writer closes the child's stdin) or
/// when all senders are gone; a write failure stops the whole transport.
async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Value>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    label: String,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(transport = %label, "writer: cancellation received, stopping");
                break;
            }

            msg = rx.recv() => {
                let Some(value) = msg else {
                    debug!(transport = %label, "writer: outbound channel closed, stopping");
                    break;
                };
                let mut bytes = match serde_json::to_vec(&value) {
                    Ok(b) => b,
                    Err(err) => {
                        warn!(transport = %label, %err, "writer: failed to serialize frame, dropping");
                        continue;
                    }
                };
                bytes.push(b'\n');
                if let Err(err) = write_frame(&mut writer, &bytes).await {
                    warn!(transport = %label, %err, "writer: stdin write failed, stopping transport");
                    running.store(false, Ordering::SeqCst);
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Reader task: frame, parse, and classify inbound lines.
async fn run_reader<R>(
    reader: R,
    inbound_tx: mpsc::Sender<Inbound>,
    outbound_tx: mpsc::Sender<Value>,
    pending: PendingMap,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    delivered: Arc<AtomicU64>,
    label: String,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut framed = FramedRead::new(reader, AcpCodec::new());
    let close_reason: Option<String> = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(transport = %label, "reader: cancellation received, stopping");
                break None;
            }

            item = framed.next() => {
                match item {
                    None => break Some("agent closed its stdout".to_owned()),
                    Some(Err(e)) => break Some(format!("stream error: {e}")),
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Err(e) => break Some(format!("malformed frame: {e}")),
                            Ok(msg) => {
                                if let Some(reason) = dispatch_frame(
                                    msg,
                                    &inbound_tx,
                                    &outbound_tx,
                                    &pending,
                                    &delivered,
                                    &label,
                                )
                                .await
                                {
                                    break Some(reason);
                                }
                            }
                        }
                    }
                }
            }
        }
    };

    running.store(false, Ordering::SeqCst);
    cancel.cancel();
    if let Some(reason) = close_reason {
        warn!(transport = %label, reason = %reason, "transport closed");
        fail_pending(&pending, &reason).await;
        if inbound_tx.send(Inbound::Closed { reason }).await.is_err() {
            debug!(transport = %label, "inbound channel gone before Closed could be delivered");
        }
    } else {
        fail_pending(&pending, "transport stopped").await;
    }
}

/// Classify one parsed frame. Returns `Some(reason)` to close the
/// transport, `None` to keep reading.
async fn dispatch_frame(
    msg: Value,
    inbound_tx: &mpsc::Sender<Inbound>,
    outbound_tx: &mpsc::Sender<Value>,
    pending: &PendingMap,
    delivered: &Arc<AtomicU64>,
    label: &str,
) -> Option<String> {
    let has_id = msg.get("id").is_some_and(|id| !id.is_null());
    let method = msg.get("method").and_then(Value::as_str).map(str::to_owned);
    let has_result = msg.get("result").is_some();
    let has_error = msg.get("error").is_some();

    if has_id && (has_result || has_error) {
        // Response to one of our calls.
        let Some(id) = msg.get("id").and_then(Value::as_u64) else {
            debug!(transport = %label, "response with non-numeric id, dropping");
            return None;
        };
        let waiter = pending.lock().await.remove(&id);
        let Some(tx) = waiter else {
            // Cancelled or unknown call; late responses are dropped.
            debug!(transport = %label, id, "response for unknown call id, dropping");
            return None;
        };
        let outcome = if has_error {
            let code = msg["error"]["code"].as_i64().unwrap_or(0);
            let message = msg["error"]["message"].as_str().unwrap_or("unknown error");
            Err(AppError::Protocol(format!("{code}: {message}")))
        } else {
            Ok(msg["result"].clone())
        };
        if tx.send(outcome).is_err() {
            debug!(transport = %label, id, "caller gone before response delivery");
        }
        return None;
    }

    if let Some(method) = method {
        let params = msg.get("params").cloned().unwrap_or(Value::Null);
        let frame = if has_id {
            Inbound::Request {
                id: msg["id"].clone(),
                method,
                params,
                responder: Responder {
                    id: msg["id"].clone(),
                    outbound: outbound_tx.clone(),
                },
            }
        } else {
            Inbound::Notification { method, params }
        };
        if inbound_tx.send(frame).await.is_err() {
            return Some("inbound consumer gone".to_owned());
        }
        delivered.fetch_add(1, Ordering::SeqCst);
        return None;
    }

    Some("frame is neither request, response, nor notification".to_owned())
}

/// Fail every waiter in the pending table with an `Acp` error.
async fn fail_pending(pending: &PendingMap, reason: &str) {
    let waiters: Vec<_> = pending.lock().await.drain().collect();
    for (id, tx) in waiters {
        if tx.send(Err(AppError::Acp(reason.to_owned()))).is_err() {
            debug!(id, "pending caller already gone during transport close");
        }
    }
}
