//! Component custom-id grammar.
//!
//! - Actions:          `<prefix>:a:<kind>:<pendingId>:<decision>` with
//!   `kind ∈ {cmd, file}` and decision tokens
//!   `accept | acceptForSession | decline | cancel` (`file` rejects
//!   `acceptForSession`).
//! - Question buttons: `<prefix>:qb:<pendingId>:<questionIndex>:<optionIndex>`
//! - Question selects: `<prefix>:q:sel:<pendingId>:<questionIndex>`

use sb_providers::app_server::ApprovalDecision;

/// Select value that routes the user to the slash-command fallback.
pub const OTHER_VALUE: &str = "__other__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Command,
    File,
}

impl ActionKind {
    fn token(&self) -> &'static str {
        match self {
            ActionKind::Command => "cmd",
            ActionKind::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomId {
    Action {
        kind: ActionKind,
        pending_id: String,
        decision: ApprovalDecision,
    },
    QuestionButton {
        pending_id: String,
        question_index: usize,
        option_index: usize,
    },
    QuestionSelect {
        pending_id: String,
        question_index: usize,
    },
}

pub fn decision_token(decision: ApprovalDecision) -> &'static str {
    match decision {
        ApprovalDecision::Accept => "accept",
        ApprovalDecision::AcceptForSession => "acceptForSession",
        ApprovalDecision::Decline => "decline",
        ApprovalDecision::Cancel => "cancel",
    }
}

pub fn parse_decision_token(token: &str) -> Option<ApprovalDecision> {
    match token {
        "accept" => Some(ApprovalDecision::Accept),
        "acceptForSession" => Some(ApprovalDecision::AcceptForSession),
        "decline" => Some(ApprovalDecision::Decline),
        "cancel" => Some(ApprovalDecision::Cancel),
        _ => None,
    }
}

pub fn encode_action(prefix: &str, kind: ActionKind, pending_id: &str, decision: ApprovalDecision) -> String {
    format!(
        "{prefix}:a:{}:{pending_id}:{}",
        kind.token(),
        decision_token(decision)
    )
}

pub fn encode_question_button(
    prefix: &str,
    pending_id: &str,
    question_index: usize,
    option_index: usize,
) -> String {
    format!("{prefix}:qb:{pending_id}:{question_index}:{option_index}")
}

pub fn encode_question_select(prefix: &str, pending_id: &str, question_index: usize) -> String {
    format!("{prefix}:q:sel:{pending_id}:{question_index}")
}

/// Parse a custom id carrying our prefix. `None` for foreign ids or
/// malformed ones (including `file` + `acceptForSession`).
pub fn parse(prefix: &str, custom_id: &str) -> Option<CustomId> {
    let rest = custom_id.strip_prefix(prefix)?.strip_prefix(':')?;
    let parts: Vec<&str> = rest.split(':').collect();
    match parts.as_slice() {
        ["a", kind, pending_id, decision] => {
            let kind = match *kind {
                "cmd" => ActionKind::Command,
                "file" => ActionKind::File,
                _ => return None,
            };
            let decision = parse_decision_token(decision)?;
            if kind == ActionKind::File && decision == ApprovalDecision::AcceptForSession {
                return None;
            }
            Some(CustomId::Action {
                kind,
                pending_id: pending_id.to_string(),
                decision,
            })
        }
        ["qb", pending_id, question_index, option_index] => Some(CustomId::QuestionButton {
            pending_id: pending_id.to_string(),
            question_index: question_index.parse().ok()?,
            option_index: option_index.parse().ok()?,
        }),
        ["q", "sel", pending_id, question_index] => Some(CustomId::QuestionSelect {
            pending_id: pending_id.to_string(),
            question_index: question_index.parse().ok()?,
        }),
        _ => None,
    }
}
