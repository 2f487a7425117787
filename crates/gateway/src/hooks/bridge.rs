//! Hook approval bridge.
//!
//! Pre-tool-use gates with a different lifecycle from the broker:
//! requests arrive over HTTP from a hook script, get announced in chat
//! with approve/deny buttons, optionally time out (clamped to 24 h;
//! 0 = unlimited) into an auto-deny, and are observed by the hook script
//! through a long-polling status endpoint. Resolved entries stay in a
//! short-TTL cache after completion so late pollers still see the
//! outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::chat::throttle::{SendOptions, ThrottleQueue};
use crate::chat::{Button, Component, Interaction, InteractionReply, OutboundMessage};

const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;
const COMPLETED_TTL: Duration = Duration::from_secs(120);
const LONG_POLL_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Pending,
    Resolved,
    Completed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeRequest {
    pub tool_name: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// 0 (or absent) = no timeout; otherwise clamped to 24 h.
    #[serde(default)]
    pub timeout_ms: u64,
}

struct BridgeEntry {
    status: BridgeStatus,
    approved: Option<bool>,
    notify: Arc<Notify>,
    completed_at: Option<Instant>,
    timeout: Option<tokio::task::JoinHandle<()>>,
}

pub struct HookApprovalBridge {
    chat: Arc<ThrottleQueue>,
    channel_id: Option<String>,
    prefix: String,
    entries: Mutex<HashMap<String, BridgeEntry>>,
}

impl HookApprovalBridge {
    pub fn new(chat: Arc<ThrottleQueue>, channel_id: Option<String>, prefix: String) -> Arc<Self> {
        Arc::new(Self {
            chat,
            channel_id,
            prefix,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Register a gate, announce it in chat, arm the auto-deny timer.
    /// Returns the gate id the hook script polls with.
    pub fn create(self: &Arc<Self>, request: BridgeRequest) -> String {
        self.evict_expired();
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let notify = Arc::new(Notify::new());

        let timeout_ms = match request.timeout_ms {
            0 => None,
            ms => Some(ms.min(MAX_TIMEOUT_MS)),
        };
        let timeout = timeout_ms.map(|ms| {
            let bridge = self.clone();
            let gate_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if bridge.resolve(&gate_id, false) {
                    tracing::info!(id = %gate_id, "hook gate timed out, auto-denied");
                }
            })
        });

        self.entries.lock().insert(
            id.clone(),
            BridgeEntry {
                status: BridgeStatus::Pending,
                approved: None,
                notify,
                completed_at: None,
                timeout,
            },
        );

        if let Some(channel) = &self.channel_id {
            let buttons = vec![
                Button {
                    custom_id: format!("{}:hb:{id}:approve", self.prefix),
                    label: "Approve".into(),
                    danger: false,
                },
                Button {
                    custom_id: format!("{}:hb:{id}:deny", self.prefix),
                    label: "Deny".into(),
                    danger: true,
                },
            ];
            let text = format!(
                "Tool gate: `{}`{}{}",
                request.tool_name,
                if request.detail.is_empty() {
                    String::new()
                } else {
                    format!("\n```\n{}\n```", request.detail)
                },
                request
                    .session_id
                    .map(|s| format!("\nsession `{s}`"))
                    .unwrap_or_default()
            );
            let chat = self.chat.clone();
            let channel = channel.clone();
            let message = OutboundMessage {
                text,
                components: vec![Component::Buttons { buttons }],
            };
            tokio::spawn(async move {
                if let Err(e) = chat
                    .send(
                        &channel,
                        message,
                        SendOptions {
                            merge_key: None,
                            high_priority: true,
                        },
                    )
                    .await
                {
                    tracing::warn!(error = %e, "failed to announce hook gate");
                }
            });
        }
        id
    }

    /// Resolve a gate. Returns false when it is unknown or already
    /// resolved.
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.status != BridgeStatus::Pending {
            return false;
        }
        entry.status = BridgeStatus::Resolved;
        entry.approved = Some(approved);
        if let Some(handle) = entry.timeout.take() {
            handle.abort();
        }
        entry.notify.notify_waiters();
        true
    }

    /// Long-poll the gate status for up to 30 s. Observing a resolution
    /// completes the gate; the completed entry lingers in a ~120 s cache
    /// for late pollers.
    pub async fn wait_status(&self, id: &str) -> Option<(BridgeStatus, Option<bool>)> {
        self.evict_expired();
        let deadline = Instant::now() + LONG_POLL_WINDOW;
        loop {
            let notify = {
                let mut entries = self.entries.lock();
                let entry = entries.get_mut(id)?;
                match entry.status {
                    BridgeStatus::Pending => entry.notify.clone(),
                    BridgeStatus::Resolved => {
                        entry.status = BridgeStatus::Completed;
                        entry.completed_at = Some(Instant::now());
                        return Some((BridgeStatus::Resolved, entry.approved));
                    }
                    BridgeStatus::Completed => {
                        return Some((BridgeStatus::Completed, entry.approved));
                    }
                }
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Some((BridgeStatus::Pending, None));
            }
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    /// Snapshot without waiting (used by tests and introspection).
    pub fn peek(&self, id: &str) -> Option<(BridgeStatus, Option<bool>)> {
        let entries = self.entries.lock();
        entries.get(id).map(|e| (e.status, e.approved))
    }

    /// Chat button handler for `<prefix>:hb:<id>:<approve|deny>` ids.
    pub fn handle_interaction(&self, interaction: &Interaction) -> Option<InteractionReply> {
        let rest = interaction
            .custom_id
            .strip_prefix(&self.prefix)?
            .strip_prefix(":hb:")?;
        let (id, verb) = rest.split_once(':')?;
        let approved = match verb {
            "approve" => true,
            "deny" => false,
            _ => return None,
        };
        let reply = if self.resolve(id, approved) {
            InteractionReply::ephemeral(if approved { "Approved." } else { "Denied." })
        } else {
            InteractionReply::ephemeral("This gate was already processed.")
        };
        Some(reply)
    }

    fn evict_expired(&self) {
        self.entries.lock().retain(|_, entry| {
            match (entry.status, entry.completed_at) {
                (BridgeStatus::Completed, Some(at)) => at.elapsed() < COMPLETED_TTL,
                _ => true,
            }
        });
    }
}

/// Clamp helper exposed for tests.
pub fn clamp_timeout_ms(requested: u64) -> Option<u64> {
    match requested {
        0 => None,
        ms => Some(ms.min(MAX_TIMEOUT_MS)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::throttle::ChatExecutor;
    use crate::chat::ChatError;
    use async_trait::async_trait;
    use sb_domain::config::ThrottleConfig;

    struct SilentChat;

    #[async_trait]
    impl ChatExecutor for SilentChat {
        async fn execute(
            &self,
            _channel_id: &str,
            _message: &OutboundMessage,
        ) -> Result<(), ChatError> {
            Ok(())
        }
    }

    fn bridge() -> Arc<HookApprovalBridge> {
        let queue = ThrottleQueue::new(Arc::new(SilentChat), ThrottleConfig::default());
        HookApprovalBridge::new(queue, Some("gate-channel".into()), "sbx".into())
    }

    fn request(timeout_ms: u64) -> BridgeRequest {
        BridgeRequest {
            tool_name: "Bash".into(),
            detail: "rm -rf /tmp/x".into(),
            session_id: None,
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn approve_flow_pending_resolved_completed() {
        let bridge = bridge();
        let id = bridge.create(request(0));
        assert_eq!(bridge.peek(&id), Some((BridgeStatus::Pending, None)));

        assert!(bridge.resolve(&id, true));
        let (status, approved) = bridge.wait_status(&id).await.unwrap();
        assert_eq!(status, BridgeStatus::Resolved);
        assert_eq!(approved, Some(true));

        // Late poller observes the completed outcome from the TTL cache.
        let (status, approved) = bridge.wait_status(&id).await.unwrap();
        assert_eq!(status, BridgeStatus::Completed);
        assert_eq!(approved, Some(true));
    }

    #[tokio::test]
    async fn double_resolution_is_rejected() {
        let bridge = bridge();
        let id = bridge.create(request(0));
        assert!(bridge.resolve(&id, false));
        assert!(!bridge.resolve(&id, true));
        assert_eq!(bridge.peek(&id).unwrap().1, Some(false));
    }

    #[tokio::test]
    async fn timeout_auto_denies() {
        let bridge = bridge();
        let id = bridge.create(request(30));
        tokio::time::sleep(Duration::from_millis(120)).await;
        let (status, approved) = bridge.wait_status(&id).await.unwrap();
        assert_eq!(status, BridgeStatus::Resolved);
        assert_eq!(approved, Some(false));
    }

    #[tokio::test]
    async fn long_poll_wakes_on_resolution() {
        let bridge = bridge();
        let id = bridge.create(request(0));

        let waiter = {
            let bridge = bridge.clone();
            let id = id.clone();
            tokio::spawn(async move { bridge.wait_status(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.resolve(&id, true);

        let (status, approved) = waiter.await.unwrap().unwrap();
        assert_eq!(status, BridgeStatus::Resolved);
        assert_eq!(approved, Some(true));
    }

    #[tokio::test]
    async fn chat_buttons_resolve() {
        let bridge = bridge();
        let id = bridge.create(request(0));
        let reply = bridge
            .handle_interaction(&Interaction {
                custom_id: format!("sbx:hb:{id}:deny"),
                user_id: "u".into(),
                channel_id: "gate-channel".into(),
                values: vec![],
            })
            .unwrap();
        assert_eq!(reply.text, "Denied.");
        assert_eq!(bridge.peek(&id).unwrap().1, Some(false));
    }

    #[test]
    fn timeout_clamps_to_24h() {
        assert_eq!(clamp_timeout_ms(0), None);
        assert_eq!(clamp_timeout_ms(5_000), Some(5_000));
        assert_eq!(clamp_timeout_ms(u64::MAX), Some(MAX_TIMEOUT_MS));
    }

    #[tokio::test]
    async fn unknown_gate_is_none() {
        let bridge = bridge();
        assert!(bridge.wait_status("missing").await.is_none());
        assert!(!bridge.resolve("missing", true));
    }
}
