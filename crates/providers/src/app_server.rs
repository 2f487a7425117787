//! JSON-RPC app-server adapter.
//!
//! Spawns a persistent child speaking newline-delimited JSON-RPC 2.0 over
//! stdio and drives the turn state machine:
//!
//! ```text
//! SPAWN → initialize → (thread/start | thread/resume) → turn/start
//!       → {server-requests ↔ notifications}* → turn/completed → STOP
//! ```
//!
//! Outbound requests are id-multiplexed through a pending map; inbound
//! messages are classified in a reader task. Server-initiated approval and
//! user-input requests dispatch to an injected handler; with no handler the
//! adapter declines (or answers each question with its first option's
//! label, else an empty string).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use sb_domain::event::{AgentEvent, AgentQuestion, QuestionOption, SessionStatus, TokenUsage};
use sb_domain::{Error, Result};

use crate::manager::{AgentProvider, SessionOptions};
use crate::rpc::{self, Inbound, OutboundRequest, OutboundResponse, RpcErrorObject};
use crate::session::{AgentSession, EventStream, StatusCell};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server-request handler contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalDecision {
    Accept,
    AcceptForSession,
    Decline,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct CommandApprovalRequest {
    pub thread_id: String,
    pub turn_id: String,
    pub item_id: String,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct FileChangeApprovalRequest {
    pub thread_id: String,
    pub turn_id: String,
    pub item_id: String,
    pub changes: Value,
}

#[derive(Debug, Clone)]
pub struct InputQuestion {
    pub id: String,
    pub question: AgentQuestion,
}

#[derive(Debug, Clone)]
pub struct ToolUserInputRequest {
    pub thread_id: String,
    pub turn_id: String,
    pub item_id: String,
    pub questions: Vec<InputQuestion>,
}

/// Answers keyed by question id.
pub type UserInputAnswers = HashMap<String, Vec<String>>;

/// Injected by the caller to resolve server-initiated interaction requests.
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn on_command_approval(&self, _req: CommandApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Decline
    }

    async fn on_file_change_approval(&self, _req: FileChangeApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Decline
    }

    async fn on_tool_user_input(&self, req: ToolUserInputRequest) -> UserInputAnswers {
        default_answers(&req)
    }
}

/// First option's label per question, else an empty string.
pub fn default_answers(req: &ToolUserInputRequest) -> UserInputAnswers {
    req.questions
        .iter()
        .map(|q| {
            let answer = q
                .question
                .options
                .first()
                .map(|o| o.label.clone())
                .unwrap_or_default();
            (q.id.clone(), vec![answer])
        })
        .collect()
}

struct DeclineHandler;

#[async_trait]
impl ServerRequestHandler for DeclineHandler {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type RpcResult = std::result::Result<Value, RpcErrorObject>;

/// Notification routed to the active turn.
#[derive(Debug, Clone)]
pub struct TurnNotification {
    pub method: String,
    pub params: Value,
}

/// Shared connection state: writer queue, pending RPCs, turn sink.
///
/// Generic over the byte streams so tests can drive an in-memory duplex
/// instead of a real child process.
pub struct AppServerConnection {
    writer_tx: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcResult>>>,
    next_id: AtomicU64,
    alive: AtomicBool,
    exit_reason: Mutex<Option<String>>,
    turn_sink: Mutex<Option<mpsc::UnboundedSender<TurnNotification>>>,
    handler: Mutex<Arc<dyn ServerRequestHandler>>,
}

impl AppServerConnection {
    pub fn start<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        let conn = Arc::new(Self {
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            exit_reason: Mutex::new(None),
            turn_sink: Mutex::new(None),
            handler: Mutex::new(Arc::new(DeclineHandler)),
        });

        // Writer task: one line per message.
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = writer_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        // Reader task: classify and dispatch until EOF.
        let reader_conn = conn.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        reader_conn.dispatch_line(&line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "app-server stdout read failed");
                        break;
                    }
                }
            }
            reader_conn.mark_dead("app-server process exited");
        });

        conn
    }

    pub fn set_handler(&self, handler: Arc<dyn ServerRequestHandler>) {
        *self.handler.lock() = handler;
    }

    fn dispatch_line(self: &Arc<Self>, line: &str) {
        let inbound = match rpc::classify(line) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unclassifiable app-server line");
                return;
            }
        };
        match inbound {
            Inbound::Response { id, result } => {
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.send(result);
                } else {
                    tracing::debug!(id, "response for unknown request id");
                }
            }
            Inbound::Notification { method, params } => {
                let sink = self.turn_sink.lock().clone();
                match sink {
                    Some(sink) => {
                        let _ = sink.send(TurnNotification { method, params });
                    }
                    None => tracing::debug!(method = %method, "notification with no active turn"),
                }
            }
            Inbound::ServerRequest { id, method, params } => {
                let conn = self.clone();
                let handler = self.handler.lock().clone();
                tokio::spawn(async move {
                    let response = handle_server_request(&method, params, handler).await;
                    let message = match response {
                        Ok(result) => OutboundResponse::ok(id, result),
                        Err(message) => OutboundResponse::err(id, -32601, message),
                    };
                    if let Ok(line) = serde_json::to_string(&message) {
                        let _ = conn.writer_tx.send(line);
                    }
                });
            }
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Rpc(self.exit_reason_or_default()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let line = serde_json::to_string(&OutboundRequest::new(id, method, params))?;
        if self.writer_tx.send(line).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Rpc(self.exit_reason_or_default()));
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::Rpc(err.to_string())),
            Err(_) => Err(Error::Rpc(self.exit_reason_or_default())),
        }
    }

    /// Route subsequent notifications to this turn. Replaces any prior sink.
    pub fn attach_turn(&self, sink: mpsc::UnboundedSender<TurnNotification>) {
        *self.turn_sink.lock() = Some(sink);
    }

    pub fn detach_turn(&self) {
        *self.turn_sink.lock() = None;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Reject every pending RPC and drop the turn sink.
    pub fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::SeqCst) {
            *self.exit_reason.lock() = Some(reason.to_string());
        }
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcErrorObject {
                code: -32000,
                message: reason.to_string(),
                data: None,
            }));
        }
        self.detach_turn();
    }

    fn exit_reason_or_default(&self) -> String {
        self.exit_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "app-server connection closed".into())
    }
}

async fn handle_server_request(
    method: &str,
    params: Value,
    handler: Arc<dyn ServerRequestHandler>,
) -> std::result::Result<Value, String> {
    let thread_id = str_field(&params, "threadId");
    let turn_id = str_field(&params, "turnId");
    let item_id = str_field(&params, "itemId");

    match method {
        "item/commandExecution/requestApproval" => {
            let decision = handler
                .on_command_approval(CommandApprovalRequest {
                    thread_id,
                    turn_id,
                    item_id,
                    command: str_field(&params, "command"),
                })
                .await;
            Ok(json!({ "decision": decision }))
        }
        "item/fileChange/requestApproval" => {
            let decision = handler
                .on_file_change_approval(FileChangeApprovalRequest {
                    thread_id,
                    turn_id,
                    item_id,
                    changes: params.get("changes").cloned().unwrap_or(Value::Null),
                })
                .await;
            // `acceptForSession` is not a valid file-change decision.
            let decision = match decision {
                ApprovalDecision::AcceptForSession => ApprovalDecision::Accept,
                other => other,
            };
            Ok(json!({ "decision": decision }))
        }
        "item/tool/requestUserInput" => {
            let questions = parse_input_questions(&params);
            let answers = handler
                .on_tool_user_input(ToolUserInputRequest {
                    thread_id,
                    turn_id,
                    item_id,
                    questions,
                })
                .await;
            Ok(json!({ "answers": answers }))
        }
        other => Err(format!("unsupported server request: {other}")),
    }
}

fn str_field(params: &Value, key: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_input_questions(params: &Value) -> Vec<InputQuestion> {
    #[derive(Deserialize)]
    struct WireQuestion {
        #[serde(default)]
        id: String,
        #[serde(default)]
        question: String,
        #[serde(default)]
        header: String,
        #[serde(default)]
        options: Vec<WireOption>,
        #[serde(default, rename = "multiSelect")]
        multi_select: bool,
    }
    #[derive(Deserialize)]
    struct WireOption {
        #[serde(default)]
        label: String,
        #[serde(default)]
        description: Option<String>,
    }

    let Some(raw) = params.get("questions").cloned() else {
        return Vec::new();
    };
    let Ok(parsed) = serde_json::from_value::<Vec<WireQuestion>>(raw) else {
        return Vec::new();
    };
    parsed
        .into_iter()
        .map(|q| InputQuestion {
            id: q.id,
            question: AgentQuestion {
                question: q.question,
                header: q.header,
                options: q
                    .options
                    .into_iter()
                    .map(|o| QuestionOption {
                        label: o.label,
                        description: o.description,
                    })
                    .collect(),
                multi_select: q.multi_select,
            },
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AppServerSession {
    conn: Arc<AppServerConnection>,
    child: Arc<Mutex<Option<Child>>>,
    status: StatusCell,
    thread_id: tokio::sync::Mutex<ThreadState>,
}

#[derive(Default)]
struct ThreadState {
    initialized: bool,
    thread_id: Option<String>,
    /// A resumed thread must be re-attached before the first turn.
    needs_resume: bool,
    announced: bool,
}

impl AppServerSession {
    /// Spawn the app-server binary and connect over its stdio.
    pub fn spawn(bin: &str, options: &SessionOptions) -> Result<Self> {
        let mut cmd = Command::new(bin);
        cmd.arg("app-server")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd.spawn().map_err(Error::Io)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ProcessExit("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessExit("child stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(line = %line, "app-server stderr");
                }
            });
        }

        let conn = AppServerConnection::start(stdout, stdin);
        Ok(Self::from_connection(conn, Some(child), options))
    }

    /// Build a session over an existing connection (tests use an in-memory
    /// duplex here).
    pub fn from_connection(
        conn: Arc<AppServerConnection>,
        child: Option<Child>,
        options: &SessionOptions,
    ) -> Self {
        let state = ThreadState {
            initialized: false,
            thread_id: options.resume_session_id.clone(),
            needs_resume: options.resume_session_id.is_some(),
            announced: false,
        };
        Self {
            conn,
            child: Arc::new(Mutex::new(child)),
            status: StatusCell::new(),
            thread_id: tokio::sync::Mutex::new(state),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn ServerRequestHandler>) {
        self.conn.set_handler(handler);
    }

    pub fn connection(&self) -> Arc<AppServerConnection> {
        self.conn.clone()
    }

    /// `initialize` + `thread/start|thread/resume`, run lazily once.
    /// Returns `(thread_id, first_announcement)`.
    async fn ensure_thread(&self) -> Result<(String, bool)> {
        let mut state = self.thread_id.lock().await;
        if !state.initialized {
            self.conn
                .request(
                    "initialize",
                    json!({ "clientInfo": { "name": "switchboard", "version": env!("CARGO_PKG_VERSION") } }),
                )
                .await?;
            state.initialized = true;
        }
        if state.needs_resume {
            let thread_id = state.thread_id.clone().unwrap_or_default();
            self.conn
                .request("thread/resume", json!({ "threadId": thread_id }))
                .await?;
            state.needs_resume = false;
        }
        if state.thread_id.is_none() {
            let result = self.conn.request("thread/start", json!({})).await?;
            let thread_id = result
                .get("threadId")
                .or_else(|| result.get("thread_id"))
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Rpc("thread/start returned no thread id".into()))?
                .to_string();
            state.thread_id = Some(thread_id);
        }
        let announce = !state.announced;
        state.announced = true;
        Ok((state.thread_id.clone().unwrap_or_default(), announce))
    }

    /// SIGTERM with a 1-second escalation to SIGKILL.
    async fn terminate_child(&self, reason: &str) {
        let pid = self.child.lock().as_ref().and_then(|c| c.id());
        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            let child_slot = self.child.clone();
            let exited = tokio::time::timeout(Duration::from_secs(1), async move {
                loop {
                    {
                        let mut slot = child_slot.lock();
                        if let Some(child) = slot.as_mut() {
                            match child.try_wait() {
                                Ok(Some(_)) => {
                                    slot.take();
                                    return;
                                }
                                Ok(None) => {}
                                Err(_) => return,
                            }
                        } else {
                            return;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            if exited.is_err() {
                if let Some(child) = self.child.lock().as_mut() {
                    let _ = child.start_kill();
                }
            }
        }
        self.conn.mark_dead(reason);
    }
}

/// Accumulates a turn's notification state.
#[derive(Default)]
struct TurnBuffers {
    /// (item id, accumulated delta) in arrival order.
    deltas: Vec<(String, String)>,
    completed: Vec<String>,
    terminal_error: Option<String>,
}

impl TurnBuffers {
    fn append_delta(&mut self, item_id: &str, delta: &str) {
        if let Some((_, buf)) = self.deltas.iter_mut().find(|(id, _)| id == item_id) {
            buf.push_str(delta);
        } else {
            self.deltas.push((item_id.to_string(), delta.to_string()));
        }
    }

    fn final_text(&self) -> String {
        if !self.completed.is_empty() {
            self.completed.join("\n\n")
        } else {
            self.deltas
                .iter()
                .map(|(_, buf)| buf.as_str())
                .collect::<Vec<_>>()
                .join("")
        }
    }
}

fn parse_turn_usage(params: &Value) -> TokenUsage {
    let usage = params
        .pointer("/turn/usage")
        .or_else(|| params.get("usage"));
    let Some(usage) = usage else {
        return TokenUsage::default();
    };
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input: field("input_tokens"),
        output: field("output_tokens"),
        cached: field("cached_input_tokens") + field("cache_read_input_tokens"),
    }
}

#[async_trait]
impl AgentSession for AppServerSession {
    async fn send(&self, message: &str) -> Result<EventStream> {
        let guard = self.status.begin_turn()?;
        let status = self.status.clone();
        let conn = self.conn.clone();

        let (thread_id, announce) = self.ensure_thread().await?;

        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();
        conn.attach_turn(notif_tx);

        let turn_result = conn
            .request(
                "turn/start",
                json!({ "threadId": thread_id, "input": message }),
            )
            .await;
        let turn_id = match turn_result {
            Ok(result) => result
                .get("turnId")
                .or_else(|| result.get("turn_id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                conn.detach_turn();
                return Err(e);
            }
        };
        tracing::debug!(thread_id = %thread_id, turn_id = %turn_id, "turn started");

        let stream = async_stream::stream! {
            let guard = guard;
            // Detach the sink on every exit path, including abandonment.
            struct DetachOnDrop(Arc<AppServerConnection>);
            impl Drop for DetachOnDrop {
                fn drop(&mut self) {
                    self.0.detach_turn();
                }
            }
            let _detach = DetachOnDrop(conn.clone());

            if announce {
                yield Ok(AgentEvent::Session { session_id: thread_id.clone() });
            }

            let mut buffers = TurnBuffers::default();
            loop {
                let Some(notification) = notif_rx.recv().await else {
                    yield Err(Error::ProcessExit(
                        "app-server exited before turn completion".into(),
                    ));
                    return;
                };
                match notification.method.as_str() {
                    "item/agentMessage/delta" => {
                        let item_id = notification
                            .params
                            .get("itemId")
                            .and_then(Value::as_str)
                            .unwrap_or("item-0");
                        let delta = notification
                            .params
                            .get("delta")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        buffers.append_delta(item_id, delta);
                    }
                    "item/completed" => {
                        let item = notification.params.get("item");
                        let item_type = item
                            .and_then(|i| i.get("type"))
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        if item_type == "agentMessage" {
                            let text = item
                                .and_then(|i| i.get("text"))
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            if !text.trim().is_empty() {
                                buffers.completed.push(text.to_string());
                            }
                        }
                    }
                    "error" => {
                        let will_retry = notification
                            .params
                            .get("willRetry")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if !will_retry {
                            let message = notification
                                .params
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("app-server error")
                                .to_string();
                            buffers.terminal_error = Some(message);
                        }
                    }
                    "turn/completed" => {
                        let turn_status = notification
                            .params
                            .pointer("/turn/status")
                            .and_then(Value::as_str)
                            .unwrap_or("completed");
                        if turn_status == "failed" {
                            let mut message = notification
                                .params
                                .pointer("/turn/error/message")
                                .and_then(Value::as_str)
                                .unwrap_or("turn failed")
                                .to_string();
                            if let Some(details) = notification
                                .params
                                .pointer("/turn/error/additionalDetails")
                                .and_then(Value::as_str)
                            {
                                message = format!("{message} ({details})");
                            }
                            yield Ok(AgentEvent::Error {
                                message,
                                recoverable: true,
                            });
                            return;
                        }
                        if let Some(message) = buffers.terminal_error.take() {
                            yield Ok(AgentEvent::Error {
                                message,
                                recoverable: true,
                            });
                            return;
                        }

                        let text = buffers.final_text();
                        if !text.is_empty() {
                            yield Ok(AgentEvent::Text {
                                text,
                                partial: false,
                            });
                        }
                        let usage = parse_turn_usage(&notification.params);
                        status.add_usage(&usage);
                        yield Ok(AgentEvent::TurnComplete {
                            usage,
                            cost_usd: None,
                            turn_index: guard.index(),
                        });
                        return;
                    }
                    other => {
                        tracing::trace!(method = %other, "unhandled app-server notification");
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn interrupt(&self) {
        self.terminate_child("interrupted").await;
    }

    fn status(&self) -> SessionStatus {
        self.status.snapshot()
    }

    async fn close(&self) {
        self.terminate_child("session closed").await;
        self.status.set_closed();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AppServerProvider {
    bin: String,
    handler: Mutex<Option<Arc<dyn ServerRequestHandler>>>,
}

impl AppServerProvider {
    pub fn new(bin: String) -> Self {
        Self {
            bin,
            handler: Mutex::new(None),
        }
    }

    /// Handler installed on every session this provider creates.
    pub fn with_handler(bin: String, handler: Arc<dyn ServerRequestHandler>) -> Self {
        Self {
            bin,
            handler: Mutex::new(Some(handler)),
        }
    }
}

#[async_trait]
impl AgentProvider for AppServerProvider {
    fn id(&self) -> &str {
        "codex-app-server"
    }

    async fn create_session(&self, options: SessionOptions) -> Result<Arc<dyn AgentSession>> {
        let session = AppServerSession::spawn(&self.bin, &options)?;
        if let Some(handler) = self.handler.lock().clone() {
            session.set_handler(handler);
        }
        Ok(Arc::new(session))
    }
}
