//! Subprocess line-JSON adapter.
//!
//! Spawns the assistant CLI with `--output-format=stream-json` and tails
//! stdout line-buffered. A provider-wide FIFO semaphore caps how many such
//! subprocesses run at once; the permit is held for the duration of one
//! `send` and released on every exit path, including caller abandonment.
//!
//! Assistant text arrives as whole-message snapshots; the parser recovers
//! streaming deltas by prefix comparison against the previous snapshot.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;

use sb_domain::event::{
    AgentEvent, AgentQuestion, QuestionOption, SessionStatus, TokenUsage, UxSeverity,
};
use sb_domain::{Error, Result};

use crate::manager::{AgentProvider, SessionOptions};
use crate::session::{AgentSession, EventStream, StatusCell};

const TOOL_DEDUPE_DETAIL_MAX: usize = 400;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire schemas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliLine {
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        #[serde(default)]
        session_id: Option<String>,
        message: CliMessage,
    },
    User {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        message: Option<CliMessage>,
    },
    Result(Box<ResultEnvelope>),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub struct CliMessage {
    #[serde(default, deserialize_with = "string_or_blocks")]
    pub content: Vec<CliContent>,
}

/// `content` is either a bare string or an array of typed blocks.
fn string_or_blocks<'de, D>(deserializer: D) -> std::result::Result<Vec<CliContent>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrBlocks {
        String(String),
        Blocks(Vec<CliContent>),
    }

    match StringOrBlocks::deserialize(deserializer)? {
        StringOrBlocks::String(s) => Ok(vec![CliContent::Text { text: s }]),
        StringOrBlocks::Blocks(blocks) => Ok(blocks),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliContent {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultEnvelope {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub usage: Option<CliUsage>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub permission_denials: Vec<PermissionDenial>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CliUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
pub struct PermissionDenial {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DeniedQuestions {
    #[serde(default)]
    questions: Vec<DeniedQuestion>,
}

#[derive(Debug, Deserialize)]
struct DeniedQuestion {
    #[serde(default)]
    question: String,
    #[serde(default)]
    header: String,
    #[serde(default)]
    options: Vec<DeniedOption>,
    #[serde(default, rename = "multiSelect")]
    multi_select: bool,
}

#[derive(Debug, Deserialize)]
struct DeniedOption {
    #[serde(default)]
    label: String,
    #[serde(default)]
    description: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Line parser state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pure per-turn parser: feed raw stdout lines, collect events, then ask
/// for the finish events once the subprocess exits.
pub struct LineParser {
    streamed: String,
    session_announced: bool,
    latched_session: Arc<Mutex<Option<String>>>,
    seen_tools: HashSet<String>,
    seen_ux: HashSet<String>,
    result: Option<Box<ResultEnvelope>>,
}

impl LineParser {
    pub fn new(latched_session: Arc<Mutex<Option<String>>>) -> Self {
        let session_announced = latched_session.lock().is_some();
        Self {
            streamed: String::new(),
            session_announced,
            latched_session,
            seen_tools: HashSet::new(),
            seen_ux: HashSet::new(),
            result: None,
        }
    }

    pub fn feed(&mut self, line: &str) -> Vec<AgentEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let parsed: CliLine = match serde_json::from_str(trimmed) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream line");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        match parsed {
            CliLine::System {
                session_id,
                subtype,
            } => {
                self.latch_session(session_id, &mut events);
                if let Some(subtype) = subtype {
                    self.ux(
                        &mut events,
                        format!("lifecycle:{subtype}"),
                        format!("session {subtype}"),
                        UxSeverity::Info,
                    );
                }
            }
            CliLine::Assistant {
                session_id,
                message,
            } => {
                self.latch_session(session_id, &mut events);
                self.assistant_message(message, &mut events);
            }
            CliLine::User {
                session_id,
                message,
            } => {
                self.latch_session(session_id, &mut events);
                if let Some(message) = message {
                    for block in message.content {
                        if let CliContent::ToolResult {
                            tool_use_id,
                            is_error,
                        } = block
                        {
                            let id = tool_use_id.unwrap_or_default();
                            let severity = if is_error {
                                UxSeverity::Warn
                            } else {
                                UxSeverity::Info
                            };
                            self.ux(
                                &mut events,
                                format!("tool_result:{id}"),
                                "tool result received".into(),
                                severity,
                            );
                        }
                    }
                }
            }
            CliLine::Result(envelope) => {
                self.latch_session(envelope.session_id.clone(), &mut events);
                self.result = Some(envelope);
            }
            CliLine::Unknown => {}
        }
        events
    }

    /// Finish events after a clean (exit 0) subprocess: the un-streamed
    /// remainder, any question recovered from permission denials, the turn
    /// completion, and a trailing error when the result subtype is not
    /// `success`.
    pub fn finish(&mut self, turn_index: u64) -> (Vec<AgentEvent>, TokenUsage) {
        let mut events = Vec::new();
        let envelope = self.result.take().unwrap_or_default();

        if let Some(final_text) = envelope.result.as_deref() {
            if let Some(remainder) = unstreamed_remainder(&self.streamed, final_text) {
                events.push(AgentEvent::Text {
                    text: remainder,
                    partial: false,
                });
            }
        }

        let questions = parse_denied_questions(&envelope.permission_denials);
        if !questions.is_empty() {
            events.push(AgentEvent::Question {
                session_id: self.latched_session.lock().clone(),
                questions,
            });
        }

        let usage = envelope
            .usage
            .map(|u| TokenUsage {
                input: u.input_tokens,
                output: u.output_tokens,
                cached: u.cache_read_input_tokens,
            })
            .unwrap_or_default();
        events.push(AgentEvent::TurnComplete {
            usage,
            cost_usd: envelope.total_cost_usd.filter(|c| *c > 0.0),
            turn_index,
        });

        match envelope.subtype.as_deref() {
            Some("success") | None => {}
            Some(other) => events.push(AgentEvent::Error {
                message: format!("turn ended with result subtype {other:?}"),
                recoverable: true,
            }),
        }

        (events, usage)
    }

    fn latch_session(&mut self, session_id: Option<String>, events: &mut Vec<AgentEvent>) {
        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
            return;
        };
        let mut latched = self.latched_session.lock();
        if latched.is_none() {
            *latched = Some(session_id.clone());
        }
        if !self.session_announced {
            self.session_announced = true;
            events.push(AgentEvent::Session { session_id });
        }
    }

    fn assistant_message(&mut self, message: CliMessage, events: &mut Vec<AgentEvent>) {
        let mut snapshot = String::new();
        for block in message.content {
            match block {
                CliContent::Text { text } => snapshot.push_str(&text),
                CliContent::Thinking { .. } => {
                    self.ux(events, "thinking".into(), "thinking".into(), UxSeverity::Info);
                }
                CliContent::ToolUse { id, name, input } => {
                    let key = match &id {
                        Some(id) => id.clone(),
                        None => {
                            let detail = input.to_string();
                            let detail: String =
                                detail.chars().take(TOOL_DEDUPE_DETAIL_MAX).collect();
                            format!("{name}:{detail}")
                        }
                    };
                    if self.seen_tools.insert(key) {
                        events.push(AgentEvent::ToolCall {
                            tool_name: name,
                            tool_input: input,
                            tool_call_id: id,
                        });
                    }
                }
                CliContent::ToolResult { .. } | CliContent::Unknown => {}
            }
        }

        if snapshot.is_empty() {
            return;
        }
        let delta = if let Some(tail) = snapshot.strip_prefix(self.streamed.as_str()) {
            tail.trim_start().to_string()
        } else {
            snapshot.clone()
        };
        self.streamed = snapshot;
        if !delta.is_empty() {
            events.push(AgentEvent::Text {
                text: delta,
                partial: true,
            });
        }
    }

    fn ux(&mut self, events: &mut Vec<AgentEvent>, key: String, label: String, severity: UxSeverity) {
        if self.seen_ux.insert(key.clone()) {
            events.push(AgentEvent::UxEvent {
                key,
                label,
                severity,
                immediate: false,
            });
        }
    }
}

/// The portion of `final_text` that was never streamed, or `None` when the
/// difference is whitespace-only.
fn unstreamed_remainder(streamed: &str, final_text: &str) -> Option<String> {
    if final_text.trim() == streamed.trim() {
        return None;
    }
    let remainder = match final_text.strip_prefix(streamed) {
        Some(tail) => tail.trim(),
        None => final_text.trim(),
    };
    if remainder.is_empty() {
        None
    } else {
        Some(remainder.to_string())
    }
}

fn parse_denied_questions(denials: &[PermissionDenial]) -> Vec<AgentQuestion> {
    let mut questions = Vec::new();
    for denial in denials {
        if denial.tool_name != "AskUserQuestion" {
            continue;
        }
        let Ok(parsed) = serde_json::from_value::<DeniedQuestions>(denial.tool_input.clone())
        else {
            continue;
        };
        for q in parsed.questions {
            if q.question.trim().is_empty() || q.options.is_empty() {
                continue;
            }
            questions.push(AgentQuestion {
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
            });
        }
    }
    questions
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ClaudeCliSession {
    bin: String,
    cwd: Option<PathBuf>,
    model: Option<String>,
    semaphore: Arc<Semaphore>,
    status: StatusCell,
    latched_session: Arc<Mutex<Option<String>>>,
    child: Arc<Mutex<Option<Child>>>,
}

impl ClaudeCliSession {
    pub fn new(bin: String, semaphore: Arc<Semaphore>, options: SessionOptions) -> Self {
        Self {
            bin,
            cwd: options.cwd,
            model: options.model,
            semaphore,
            status: StatusCell::new(),
            latched_session: Arc::new(Mutex::new(options.resume_session_id)),
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// The backend session id, once announced.
    pub fn session_id(&self) -> Option<String> {
        self.latched_session.lock().clone()
    }

    fn build_command(&self, message: &str) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p")
            .arg(message)
            .arg("--verbose")
            .arg("--output-format=stream-json");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(session_id) = self.latched_session.lock().as_deref() {
            cmd.arg("--resume").arg(session_id);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Kills a still-running child when the stream is abandoned mid-turn.
/// On a completed turn the child has already been taken out for `wait`.
struct KillOnDrop {
    child: Arc<Mutex<Option<Child>>>,
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Some(child) = self.child.lock().as_mut() {
            let _ = child.start_kill();
        }
    }
}

#[async_trait]
impl AgentSession for ClaudeCliSession {
    async fn send(&self, message: &str) -> Result<EventStream> {
        let guard = self.status.begin_turn()?;
        let status = self.status.clone();
        let semaphore = self.semaphore.clone();
        let latched = self.latched_session.clone();
        let child_slot = self.child.clone();
        let mut cmd = self.build_command(message);

        let stream = async_stream::stream! {
            let guard = guard;

            // FIFO gate on concurrent subprocesses. The owned permit lives
            // in this scope, so abandonment releases it too.
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    yield Err(Error::Other("subprocess semaphore closed".into()));
                    return;
                }
            };
            let _permit = permit;

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    yield Err(Error::ProcessExit(format!("spawn failed: {e}")));
                    return;
                }
            };
            let stdout = match child.stdout.take() {
                Some(stdout) => stdout,
                None => {
                    yield Err(Error::ProcessExit("child stdout unavailable".into()));
                    return;
                }
            };
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::debug!(line = %line, "cli stderr");
                    }
                });
            }
            *child_slot.lock() = Some(child);
            let _kill_guard = KillOnDrop { child: child_slot.clone() };

            let mut parser = LineParser::new(latched);
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        for event in parser.feed(&line) {
                            yield Ok(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Io(e));
                        return;
                    }
                }
            }

            let exit = child_slot.lock().take();
            let code = match exit {
                Some(mut child) => match child.wait().await {
                    Ok(code) => code.code(),
                    Err(e) => {
                        yield Err(Error::ProcessExit(format!("wait failed: {e}")));
                        return;
                    }
                },
                None => None,
            };

            match code {
                Some(0) => {
                    let (events, usage) = parser.finish(guard.index());
                    status.add_usage(&usage);
                    for event in events {
                        yield Ok(event);
                    }
                }
                Some(code) => {
                    yield Ok(AgentEvent::Error {
                        message: format!("assistant CLI exited with code {code}"),
                        recoverable: true,
                    });
                }
                None => {
                    yield Ok(AgentEvent::Error {
                        message: "assistant CLI terminated by signal".into(),
                        recoverable: true,
                    });
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn interrupt(&self) {
        if let Some(child) = self.child.lock().as_mut() {
            let _ = child.start_kill();
        }
    }

    fn status(&self) -> SessionStatus {
        self.status.snapshot()
    }

    async fn close(&self) {
        self.interrupt().await;
        self.status.set_closed();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ClaudeCliProvider {
    bin: String,
    semaphore: Arc<Semaphore>,
}

impl ClaudeCliProvider {
    pub fn new(bin: String, max_concurrent: usize) -> Self {
        Self {
            bin,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl AgentProvider for ClaudeCliProvider {
    fn id(&self) -> &str {
        "claude"
    }

    async fn create_session(&self, options: SessionOptions) -> Result<Arc<dyn AgentSession>> {
        Ok(Arc::new(ClaudeCliSession::new(
            self.bin.clone(),
            self.semaphore.clone(),
            options,
        )))
    }
}
