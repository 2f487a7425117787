//! Transcript line schemas and the streaming metadata extractor.
//!
//! Assistant transcripts are JSONL files of tagged records. The extractor
//! consumes lines incrementally (it is fed by a tailer group) and derives
//! the metadata the monitor publishes: model, slug, working directory, git
//! branch, CLI version, turn count, accumulated tokens, the latest user
//! message, currently running tools, and the wait/phase markers.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use sb_domain::event::TokenUsage;
use sb_domain::snapshot::{truncate_chars, ActivityPhase, WaitReason};

/// Tool that asks the human a structured question; a pending call marks the
/// session as waiting on an answer rather than on a permission grant.
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

const LAST_USER_MESSAGE_MAX: usize = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptRecord {
    User(Box<ChatRecord>),
    Assistant(Box<ChatRecord>),
    Summary {
        #[serde(default)]
        summary: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub message: ChatMessage,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub is_meta: bool,
    #[serde(default)]
    pub is_sidechain: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "string_or_blocks")]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<MessageUsage>,
}

fn string_or_blocks<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrBlocks {
        String(String),
        Blocks(Vec<ContentBlock>),
    }

    match StringOrBlocks::deserialize(deserializer)? {
        StringOrBlocks::String(s) => Ok(vec![ContentBlock::Text { text: s }]),
        StringOrBlocks::Blocks(blocks) => Ok(blocks),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extractor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streaming metadata accumulator for one transcript file.
#[derive(Debug, Default)]
pub struct TranscriptExtractor {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub slug: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub version: Option<String>,
    pub turn_count: u64,
    pub tokens: TokenUsage,
    pub last_user_message: Option<String>,
    pub current_tools: Vec<String>,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    /// tool_use id → tool name, cleared as results arrive.
    pending_tools: HashMap<String, String>,
    last_stop_reason: Option<String>,
}

impl TranscriptExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw transcript line. Unparseable lines are skipped.
    pub fn feed(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let record: TranscriptRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(e) => {
                tracing::trace!(error = %e, "skipping unparseable transcript line");
                return;
            }
        };
        match record {
            TranscriptRecord::Summary { summary } => {
                if !summary.is_empty() {
                    self.slug = Some(summary);
                }
            }
            TranscriptRecord::User(record) => self.feed_user(*record),
            TranscriptRecord::Assistant(record) => self.feed_assistant(*record),
            TranscriptRecord::Unknown => {}
        }
    }

    fn feed_common(&mut self, record: &ChatRecord) {
        if self.session_id.is_none() {
            self.session_id = record.session_id.clone();
        }
        if let Some(cwd) = &record.cwd {
            self.cwd = Some(cwd.clone());
        }
        if let Some(branch) = &record.git_branch {
            self.git_branch = Some(branch.clone());
        }
        if let Some(version) = &record.version {
            self.version = Some(version.clone());
        }
        if let Some(ts) = &record.timestamp {
            if self.first_timestamp.is_none() {
                self.first_timestamp = Some(ts.clone());
            }
            self.last_timestamp = Some(ts.clone());
        }
    }

    fn feed_user(&mut self, record: ChatRecord) {
        self.feed_common(&record);
        if record.is_sidechain {
            return;
        }

        let mut had_text = false;
        for block in &record.message.content {
            match block {
                ContentBlock::Text { text } => {
                    if !record.is_meta && !text.trim().is_empty() {
                        had_text = true;
                        self.last_user_message =
                            Some(truncate_chars(text.trim(), LAST_USER_MESSAGE_MAX));
                    }
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    self.pending_tools.remove(tool_use_id);
                }
                _ => {}
            }
        }
        if had_text {
            self.turn_count += 1;
            // A fresh user prompt supersedes whatever the previous
            // assistant message ended with.
            self.last_stop_reason = None;
        }
    }

    fn feed_assistant(&mut self, record: ChatRecord) {
        self.feed_common(&record);
        if record.is_sidechain {
            return;
        }

        if let Some(model) = &record.message.model {
            self.model = Some(model.clone());
        }
        if let Some(usage) = &record.message.usage {
            self.tokens.add(&TokenUsage {
                input: usage.input_tokens,
                output: usage.output_tokens,
                cached: usage.cache_read_input_tokens,
            });
        }
        self.last_stop_reason = record.message.stop_reason.clone();

        let mut tools = Vec::new();
        for block in &record.message.content {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                tools.push(name.clone());
                self.pending_tools.insert(id.clone(), name.clone());
            }
        }
        // Tool names of the latest assistant message only.
        self.current_tools = tools;
    }

    /// Tool names whose `tool_use` has no matching `tool_result` yet.
    pub fn wait_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending_tools.values().cloned().collect();
        names.sort();
        names
    }

    pub fn wait_reason(&self) -> Option<WaitReason> {
        if self.pending_tools.is_empty() {
            None
        } else if self
            .pending_tools
            .values()
            .any(|name| name == ASK_USER_QUESTION_TOOL)
        {
            Some(WaitReason::UserQuestion)
        } else {
            Some(WaitReason::Permission)
        }
    }

    /// Phase from the transcript's terminal markers. A hook-delivered phase,
    /// when fresher, overrides this at the monitor level.
    pub fn activity_phase(&self) -> ActivityPhase {
        if !self.pending_tools.is_empty() {
            if self
                .pending_tools
                .values()
                .any(|name| name == ASK_USER_QUESTION_TOOL)
            {
                ActivityPhase::WaitingQuestion
            } else {
                ActivityPhase::WaitingPermission
            }
        } else if self.last_stop_reason.as_deref() == Some("end_turn") {
            ActivityPhase::Interactable
        } else {
            ActivityPhase::Busy
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tail read for hook forwarding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const TAIL_TEXT_MAX: usize = 1_800;

/// Read a transcript backwards for the last assistant entry and return its
/// `text` blocks joined with `\n` (tool_use / thinking blocks are ignored),
/// truncated to ~1,800 chars. `None` when nothing qualifies.
pub fn last_assistant_text(path: &std::path::Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    for line in raw.lines().rev() {
        let record: TranscriptRecord = match serde_json::from_str(line.trim()) {
            Ok(record) => record,
            Err(_) => continue,
        };
        let TranscriptRecord::Assistant(record) = record else {
            continue;
        };
        let texts: Vec<&str> = record
            .message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if texts.is_empty() {
            continue;
        }
        return Some(truncate_chars(&texts.join("\n"), TAIL_TEXT_MAX));
    }
    None
}
