//! Pending-request registry pairing adapter-side approval requests with
//! chat interactions.
//!
//! Each request registers a record with a resolve continuation, posts a
//! prompt with buttons or a select menu, and suspends until a click, a
//! slash-command answer, or an admin resolution arrives. The map is
//! bounded advisorily: past the limit the broker warns and keeps
//! accepting.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use sb_providers::app_server::{
    ApprovalDecision, CommandApprovalRequest, FileChangeApprovalRequest, InputQuestion,
    ToolUserInputRequest, UserInputAnswers,
};

use crate::chat::throttle::{SendOptions, ThrottleQueue};
use crate::chat::{Button, Component, Interaction, InteractionReply, OutboundMessage, SelectOption};

use super::custom_id::{
    self, decision_token, parse_decision_token, ActionKind, CustomId, OTHER_VALUE,
};

const MAX_BUTTON_OPTIONS: usize = 5;
const MAX_SELECT_OPTIONS: usize = 24; // + 1 "other" entry

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingKind {
    CommandExecution,
    FileChange,
    ToolUserInput,
}

/// Typed failures for admin resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("not_found")]
    NotFound,
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_decision: {0}")]
    InvalidDecision(String),
}

enum Continuation {
    Approval(oneshot::Sender<ApprovalDecision>),
    UserInput(oneshot::Sender<UserInputAnswers>),
}

struct PendingRecord {
    kind: PendingKind,
    channel_id: String,
    #[allow(dead_code)]
    thread_id: String,
    owner_user_id: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
    decision: Option<String>,
    /// `ToolUserInput` only: the question manifest and accumulating
    /// answers, plus the first responder's latched user id.
    questions: Vec<InputQuestion>,
    answers: HashMap<String, Vec<String>>,
    responder_user_id: Option<String>,
    continuation: Option<Continuation>,
}

/// Introspection view of one pending record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingInfo {
    pub pending_id: String,
    pub kind: PendingKind,
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

pub struct ApprovalBroker {
    chat: Arc<ThrottleQueue>,
    prefix: String,
    max_pending: usize,
    pending: Mutex<HashMap<String, PendingRecord>>,
}

impl ApprovalBroker {
    pub fn new(chat: Arc<ThrottleQueue>, prefix: String, max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            chat,
            prefix,
            max_pending,
            pending: Mutex::new(HashMap::new()),
        })
    }

    // ── Request side ───────────────────────────────────────────────────

    pub async fn request_command_approval(
        &self,
        channel_id: &str,
        owner_user_id: Option<String>,
        req: &CommandApprovalRequest,
    ) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        let pending_id = self.register(PendingRecord {
            kind: PendingKind::CommandExecution,
            channel_id: channel_id.to_string(),
            thread_id: req.thread_id.clone(),
            owner_user_id,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            decision: None,
            questions: Vec::new(),
            answers: HashMap::new(),
            responder_user_id: None,
            continuation: Some(Continuation::Approval(tx)),
        });

        let buttons = [
            (ApprovalDecision::Accept, "Accept", false),
            (ApprovalDecision::AcceptForSession, "Accept for session", false),
            (ApprovalDecision::Decline, "Decline", true),
            (ApprovalDecision::Cancel, "Cancel", true),
        ]
        .into_iter()
        .map(|(decision, label, danger)| Button {
            custom_id: custom_id::encode_action(&self.prefix, ActionKind::Command, &pending_id, decision),
            label: label.to_string(),
            danger,
        })
        .collect();

        let message = OutboundMessage {
            text: format!("Approve command?\n```\n{}\n```", req.command),
            components: vec![Component::Buttons { buttons }],
        };
        self.post(channel_id, message).await;

        rx.await.unwrap_or(ApprovalDecision::Decline)
    }

    pub async fn request_file_change_approval(
        &self,
        channel_id: &str,
        owner_user_id: Option<String>,
        req: &FileChangeApprovalRequest,
    ) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        let pending_id = self.register(PendingRecord {
            kind: PendingKind::FileChange,
            channel_id: channel_id.to_string(),
            thread_id: req.thread_id.clone(),
            owner_user_id,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            decision: None,
            questions: Vec::new(),
            answers: HashMap::new(),
            responder_user_id: None,
            continuation: Some(Continuation::Approval(tx)),
        });

        // File changes have no per-session grant.
        let buttons = [
            (ApprovalDecision::Accept, "Accept", false),
            (ApprovalDecision::Decline, "Decline", true),
            (ApprovalDecision::Cancel, "Cancel", true),
        ]
        .into_iter()
        .map(|(decision, label, danger)| Button {
            custom_id: custom_id::encode_action(&self.prefix, ActionKind::File, &pending_id, decision),
            label: label.to_string(),
            danger,
        })
        .collect();

        let summary = serde_json::to_string_pretty(&req.changes).unwrap_or_default();
        let message = OutboundMessage {
            text: format!("Approve file changes?\n```json\n{summary}\n```"),
            components: vec![Component::Buttons { buttons }],
        };
        self.post(channel_id, message).await;

        rx.await.unwrap_or(ApprovalDecision::Decline)
    }

    pub async fn request_tool_user_input(
        &self,
        channel_id: &str,
        owner_user_id: Option<String>,
        req: &ToolUserInputRequest,
    ) -> UserInputAnswers {
        let (tx, rx) = oneshot::channel();
        let pending_id = self.register(PendingRecord {
            kind: PendingKind::ToolUserInput,
            channel_id: channel_id.to_string(),
            thread_id: req.thread_id.clone(),
            owner_user_id,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            decision: None,
            questions: req.questions.clone(),
            answers: HashMap::new(),
            responder_user_id: None,
            continuation: Some(Continuation::UserInput(tx)),
        });

        for (index, q) in req.questions.iter().enumerate() {
            let header = if q.question.header.is_empty() {
                q.question.question.clone()
            } else {
                format!("**{}**\n{}", q.question.header, q.question.question)
            };
            let component = if q.question.options.len() <= MAX_BUTTON_OPTIONS {
                Component::Buttons {
                    buttons: q
                        .question
                        .options
                        .iter()
                        .enumerate()
                        .map(|(opt_index, opt)| Button {
                            custom_id: custom_id::encode_question_button(
                                &self.prefix,
                                &pending_id,
                                index,
                                opt_index,
                            ),
                            label: opt.label.clone(),
                            danger: false,
                        })
                        .collect(),
                }
            } else {
                let mut options: Vec<SelectOption> = q
                    .question
                    .options
                    .iter()
                    .take(MAX_SELECT_OPTIONS)
                    .enumerate()
                    .map(|(opt_index, opt)| SelectOption {
                        value: opt_index.to_string(),
                        label: opt.label.clone(),
                        description: opt.description.clone(),
                    })
                    .collect();
                options.push(SelectOption {
                    value: OTHER_VALUE.to_string(),
                    label: "Other…".into(),
                    description: Some("Answer with a text command".into()),
                });
                Component::Select {
                    custom_id: custom_id::encode_question_select(&self.prefix, &pending_id, index),
                    placeholder: "Pick an answer".into(),
                    options,
                }
            };
            let message = OutboundMessage {
                text: header,
                components: vec![component],
            };
            self.post(channel_id, message).await;
        }

        rx.await.unwrap_or_default()
    }

    fn register(&self, record: PendingRecord) -> String {
        let pending_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            // Advisory bound: warn and preserve rather than evict.
            tracing::warn!(
                size = pending.len(),
                max = self.max_pending,
                "pending approval map over its advisory bound"
            );
        }
        pending.insert(pending_id.clone(), record);
        pending_id
    }

    async fn post(&self, channel_id: &str, message: OutboundMessage) {
        let send = self.chat.send(
            channel_id,
            message,
            SendOptions {
                merge_key: None,
                high_priority: true,
            },
        );
        if let Err(e) = send.await {
            tracing::warn!(channel = %channel_id, error = %e, "failed to post approval prompt");
        }
    }

    // ── Interaction side ───────────────────────────────────────────────

    pub fn handle_interaction(&self, interaction: &Interaction) -> Option<InteractionReply> {
        let parsed = custom_id::parse(&self.prefix, &interaction.custom_id)?;
        let reply = match parsed {
            CustomId::Action {
                pending_id,
                decision,
                ..
            } => self.resolve_approval(&pending_id, decision, &interaction.user_id),
            CustomId::QuestionButton {
                pending_id,
                question_index,
                option_index,
            } => self.answer_question_by_option(
                &pending_id,
                question_index,
                &[option_index.to_string()],
                &interaction.user_id,
                true,
            ),
            CustomId::QuestionSelect {
                pending_id,
                question_index,
            } => {
                if interaction.values.iter().any(|v| v == OTHER_VALUE) {
                    InteractionReply::ephemeral(format!(
                        "Answer with `/codex-input {pending_id} {} <answer>`",
                        question_index + 1
                    ))
                } else {
                    self.answer_question_by_option(
                        &pending_id,
                        question_index,
                        &interaction.values,
                        &interaction.user_id,
                        true,
                    )
                }
            }
        };
        Some(reply)
    }

    fn resolve_approval(
        &self,
        pending_id: &str,
        decision: ApprovalDecision,
        user_id: &str,
    ) -> InteractionReply {
        let mut pending = self.pending.lock();
        let Some(record) = pending.get_mut(pending_id) else {
            return InteractionReply::ephemeral("This request was already processed.");
        };
        if record.resolved_at.is_some() {
            return InteractionReply::ephemeral("This request was already processed.");
        }
        if let Some(owner) = &record.owner_user_id {
            if owner != user_id {
                return InteractionReply::ephemeral("Only the session owner can respond.");
            }
        }

        record.resolved_at = Some(Utc::now());
        record.resolved_by = Some(user_id.to_string());
        record.decision = Some(decision_token(decision).to_string());
        if let Some(Continuation::Approval(tx)) = record.continuation.take() {
            let _ = tx.send(decision);
            InteractionReply::ephemeral(format!("Recorded: {}", decision_token(decision)))
        } else {
            InteractionReply::ephemeral("This request does not take that action.")
        }
    }

    /// Record the chosen option(s) for one question. Option values are
    /// indices into the question's option list. Finalizes the pending once
    /// every question in the manifest has an answer.
    fn answer_question_by_option(
        &self,
        pending_id: &str,
        question_index: usize,
        values: &[String],
        user_id: &str,
        values_are_indices: bool,
    ) -> InteractionReply {
        let mut pending = self.pending.lock();
        let Some(record) = pending.get_mut(pending_id) else {
            return InteractionReply::ephemeral("This request was already processed.");
        };
        if record.resolved_at.is_some() {
            return InteractionReply::ephemeral("This request was already processed.");
        }
        if record.kind != PendingKind::ToolUserInput {
            return InteractionReply::ephemeral("This request does not take answers.");
        }
        // Single responder: the first user to answer latches the pending.
        match &record.responder_user_id {
            Some(responder) if responder != user_id => {
                return InteractionReply::ephemeral("Someone else is already answering this one.");
            }
            Some(_) => {}
            None => record.responder_user_id = Some(user_id.to_string()),
        }

        let Some(question) = record.questions.get(question_index) else {
            return InteractionReply::ephemeral("Unknown question.");
        };
        let question_id = question.id.clone();
        let answers: Vec<String> = if values_are_indices {
            values
                .iter()
                .filter_map(|v| v.parse::<usize>().ok())
                .filter_map(|i| question.question.options.get(i))
                .map(|opt| opt.label.clone())
                .collect()
        } else {
            values.to_vec()
        };
        if answers.is_empty() {
            return InteractionReply::ephemeral("Unknown option.");
        }
        record.answers.insert(question_id, answers);

        let all_answered = record
            .questions
            .iter()
            .all(|q| record.answers.contains_key(&q.id));
        if all_answered {
            record.resolved_at = Some(Utc::now());
            record.resolved_by = Some(user_id.to_string());
            if let Some(Continuation::UserInput(tx)) = record.continuation.take() {
                let _ = tx.send(record.answers.clone());
            }
            InteractionReply::ephemeral("All answers recorded.")
        } else {
            let remaining = record.questions.len() - record.answers.len();
            InteractionReply::ephemeral(format!("Recorded. {remaining} question(s) left."))
        }
    }

    /// `/codex-input <pendingId> <1-based question index> <answer>`.
    pub fn handle_text_answer(
        &self,
        pending_id: &str,
        question_number: usize,
        answer: &str,
        user_id: &str,
    ) -> InteractionReply {
        if question_number == 0 {
            return InteractionReply::ephemeral("Question numbers start at 1.");
        }
        self.answer_question_by_option(
            pending_id,
            question_number - 1,
            &[answer.to_string()],
            user_id,
            false,
        )
    }

    // ── Admin resolution ───────────────────────────────────────────────

    /// Resolve a pending out-of-band. Approval kinds accept the four
    /// decision tokens; `toolUserInput` accepts only `cancel | decline`
    /// and resolves with an empty answer map.
    pub fn resolve_pending(
        &self,
        pending_id: &str,
        decision: Option<&str>,
        actor_user_id: Option<&str>,
    ) -> Result<(), ResolveError> {
        let mut pending = self.pending.lock();
        let record = pending
            .get_mut(pending_id)
            .ok_or(ResolveError::NotFound)?;
        if record.resolved_at.is_some() {
            return Err(ResolveError::InvalidRequest("already resolved".into()));
        }

        match record.kind {
            PendingKind::CommandExecution | PendingKind::FileChange => {
                let token = decision.unwrap_or("decline");
                let decision = parse_decision_token(token)
                    .ok_or_else(|| ResolveError::InvalidDecision(token.to_string()))?;
                if record.kind == PendingKind::FileChange
                    && decision == ApprovalDecision::AcceptForSession
                {
                    return Err(ResolveError::InvalidDecision(token.to_string()));
                }
                record.resolved_at = Some(Utc::now());
                record.resolved_by = actor_user_id.map(|s| s.to_string());
                record.decision = Some(token.to_string());
                if let Some(Continuation::Approval(tx)) = record.continuation.take() {
                    let _ = tx.send(decision);
                }
                Ok(())
            }
            PendingKind::ToolUserInput => {
                let token = decision.unwrap_or("cancel");
                if !matches!(token, "cancel" | "decline") {
                    return Err(ResolveError::InvalidDecision(token.to_string()));
                }
                record.resolved_at = Some(Utc::now());
                record.resolved_by = actor_user_id.map(|s| s.to_string());
                record.decision = Some(token.to_string());
                if let Some(Continuation::UserInput(tx)) = record.continuation.take() {
                    let _ = tx.send(HashMap::new());
                }
                Ok(())
            }
        }
    }

    pub fn list_pending(&self) -> Vec<PendingInfo> {
        self.pending
            .lock()
            .iter()
            .map(|(id, record)| PendingInfo {
                pending_id: id.clone(),
                kind: record.kind,
                channel_id: record.channel_id.clone(),
                created_at: record.created_at,
                resolved: record.resolved_at.is_some(),
                resolved_by: record.resolved_by.clone(),
                decision: record.decision.clone(),
            })
            .collect()
    }
}
