//! The unified agent-event stream contract.
//!
//! Every provider adapter — whatever its substrate (SDK, line-JSON CLI,
//! JSON-RPC server) — translates its backend's output into this one tagged
//! union. Consumers never see backend-specific shapes.

use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A boxed async stream, used for session event sequences.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during one session turn (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Streaming or final assistant text. `partial: true` deltas append
    /// within one logical message; a `partial: false` supersedes them.
    Text { text: String, partial: bool },

    /// Backend-assigned session identity. May arrive late or never.
    Session { session_id: String },

    /// Model reasoning text.
    Reasoning { text: String },

    /// A tool invocation observed in the stream.
    ToolCall {
        tool_name: String,
        tool_input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },

    /// Result for a prior tool invocation.
    ToolResult {
        tool_call_id: String,
        result: serde_json::Value,
        is_error: bool,
    },

    /// A file the agent created, edited, deleted, or renamed.
    FileChange {
        kind: FileChangeKind,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
    },

    /// A shell command the agent ran.
    Command {
        command: String,
        status: CommandStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    /// Current todo-list state.
    Todo { items: Vec<TodoItem> },

    /// Lifecycle marker intended for the chat surface; coalesced by `key`.
    UxEvent {
        key: String,
        label: String,
        severity: UxSeverity,
        #[serde(default)]
        immediate: bool,
    },

    /// The agent is asking the human a structured question.
    Question {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        questions: Vec<AgentQuestion>,
    },

    /// Logical end of the turn. At most one per `send` call.
    TurnComplete {
        usage: TokenUsage,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        turn_index: u64,
    },

    /// A fault surfaced to the consumer without breaking the stream.
    Error { message: String, recoverable: bool },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Create,
    Edit,
    Delete,
    Rename,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UxSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentQuestion {
    pub question: String,
    pub header: String,
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionOption {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token accounting & session status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage for one turn (or accumulated across turns).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cached: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cached += other.cached;
    }

    pub fn total(&self) -> u64 {
        self.input + self.output + self.cached
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Processing,
    Closed,
}

/// Point-in-time view of a session's lifecycle counters.
///
/// `turn_count` advances by exactly one per `send` call that began
/// processing, including calls whose stream failed mid-way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub turn_count: u64,
    pub total_tokens: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            turn_count: 0,
            total_tokens: TokenUsage::default(),
            last_activity: None,
        }
    }
}
