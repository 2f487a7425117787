//! SDK-backed adapter.
//!
//! Wraps a stateful client library whose `run_streamed` yields thread
//! events. The adapter's job is pure translation: thread items become
//! unified [`AgentEvent`]s, turn completion folds token usage into the
//! session counters, and a failed turn surfaces as a non-recoverable error
//! event rather than a stream failure.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use sb_domain::event::{
    AgentEvent, CommandStatus, FileChangeKind, SessionStatus, TodoItem, TodoStatus, TokenUsage,
};
use sb_domain::{BoxStream, Result};

use crate::session::{AgentSession, EventStream, StatusCell};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SDK-side event model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One event from the SDK's streamed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadEvent {
    ItemStarted { item: ThreadItem },
    ItemUpdated { item: ThreadItem },
    ItemCompleted { item: ThreadItem },
    TurnCompleted { usage: SdkUsage },
    TurnFailed { error: String },
    SessionConfigured { session_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "item_type", rename_all = "snake_case")]
pub enum ThreadItem {
    AgentMessage {
        text: String,
    },
    Reasoning {
        text: String,
    },
    CommandExecution {
        command: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        aggregated_output: Option<String>,
        #[serde(default)]
        changes: Vec<SdkFileChange>,
    },
    FileChange {
        changes: Vec<SdkFileChange>,
    },
    McpToolCall {
        server: String,
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
        status: SdkCallStatus,
    },
    WebSearch {
        query: String,
    },
    TodoList {
        items: Vec<SdkTodoItem>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkFileChange {
    pub kind: FileChangeKind,
    pub path: String,
    #[serde(default)]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SdkCallStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkTodoItem {
    pub content: String,
    pub completed: bool,
    #[serde(default)]
    pub in_progress: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SdkUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

/// The backing SDK client, abstracted so tests can script turns.
#[async_trait]
pub trait CodexClient: Send + Sync {
    async fn run_streamed(&self, message: &str) -> Result<BoxStream<'static, Result<ThreadEvent>>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CodexSdkSession {
    client: Arc<dyn CodexClient>,
    status: StatusCell,
}

impl CodexSdkSession {
    pub fn new(client: Arc<dyn CodexClient>) -> Self {
        Self {
            client,
            status: StatusCell::new(),
        }
    }
}

fn map_item(item: ThreadItem, out: &mut Vec<AgentEvent>) {
    match item {
        ThreadItem::AgentMessage { text } => {
            if !text.trim().is_empty() {
                out.push(AgentEvent::Text {
                    text,
                    partial: false,
                });
            }
        }
        ThreadItem::Reasoning { text } => out.push(AgentEvent::Reasoning { text }),
        ThreadItem::CommandExecution {
            command,
            exit_code,
            aggregated_output,
            changes,
        } => {
            let status = match exit_code {
                Some(0) => CommandStatus::Completed,
                Some(_) => CommandStatus::Failed,
                None => CommandStatus::Completed,
            };
            out.push(AgentEvent::Command {
                command,
                status,
                exit_code,
                output: aggregated_output,
            });
            for change in changes {
                out.push(AgentEvent::FileChange {
                    kind: change.kind,
                    path: change.path,
                    diff: change.diff,
                });
            }
        }
        ThreadItem::FileChange { changes } => {
            for change in changes {
                out.push(AgentEvent::FileChange {
                    kind: change.kind,
                    path: change.path,
                    diff: change.diff,
                });
            }
        }
        ThreadItem::McpToolCall {
            server,
            tool,
            arguments,
            status,
        } => {
            out.push(AgentEvent::ToolCall {
                tool_name: format!("mcp__{server}__{tool}"),
                tool_input: arguments,
                tool_call_id: None,
            });
            if status == SdkCallStatus::Failed {
                out.push(AgentEvent::Error {
                    message: format!("MCP tool {server}/{tool} failed"),
                    recoverable: true,
                });
            }
        }
        ThreadItem::WebSearch { query } => out.push(AgentEvent::ToolCall {
            tool_name: "web_search".into(),
            tool_input: serde_json::json!({ "query": query }),
            tool_call_id: None,
        }),
        ThreadItem::TodoList { items } => out.push(AgentEvent::Todo {
            items: items
                .into_iter()
                .map(|i| TodoItem {
                    status: if i.completed {
                        TodoStatus::Completed
                    } else if i.in_progress {
                        TodoStatus::InProgress
                    } else {
                        TodoStatus::Pending
                    },
                    content: i.content,
                })
                .collect(),
        }),
    }
}

#[async_trait]
impl AgentSession for CodexSdkSession {
    async fn send(&self, message: &str) -> Result<EventStream> {
        let guard = self.status.begin_turn()?;
        let mut inner = self.client.run_streamed(message).await?;
        let status = self.status.clone();

        let stream = async_stream::stream! {
            // Moved in so that dropping the stream tears the turn down.
            let guard = guard;

            while let Some(event) = inner.next().await {
                let event = match event {
                    Ok(ev) => ev,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                match event {
                    ThreadEvent::SessionConfigured { session_id } => {
                        yield Ok(AgentEvent::Session { session_id });
                    }
                    ThreadEvent::ItemCompleted { item } => {
                        let mut mapped = Vec::new();
                        map_item(item, &mut mapped);
                        for ev in mapped {
                            yield Ok(ev);
                        }
                    }
                    ThreadEvent::ItemUpdated { item } | ThreadEvent::ItemStarted { item } => {
                        // Only the todo list is interesting before completion.
                        if let ThreadItem::TodoList { .. } = item {
                            let mut mapped = Vec::new();
                            map_item(item, &mut mapped);
                            for ev in mapped {
                                yield Ok(ev);
                            }
                        }
                    }
                    ThreadEvent::TurnCompleted { usage } => {
                        let usage = TokenUsage {
                            input: usage.input_tokens,
                            output: usage.output_tokens,
                            cached: usage.cached_input_tokens,
                        };
                        status.add_usage(&usage);
                        yield Ok(AgentEvent::TurnComplete {
                            usage,
                            cost_usd: None,
                            turn_index: guard.index(),
                        });
                        return;
                    }
                    ThreadEvent::TurnFailed { error } => {
                        yield Ok(AgentEvent::Error {
                            message: error,
                            recoverable: false,
                        });
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn status(&self) -> SessionStatus {
        self.status.snapshot()
    }

    async fn close(&self) {
        self.status.set_closed();
    }
}
