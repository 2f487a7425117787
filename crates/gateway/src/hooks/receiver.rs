//! Hook receiver.
//!
//! `POST /api/hook` delivers out-of-band lifecycle events from the
//! assistant's hook scripts. Events inject authoritative `activityPhase`
//! values into the monitor and drive the hook-path thread discovery; the
//! `Stop` event additionally forwards the last assistant text into the
//! session's chat thread (fire-and-forget).

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use sb_domain::snapshot::{ActivityPhase, Provider, SnapshotState};
use sb_sessions::monitor::{HookSessionEvent, SessionMonitor};
use sb_sessions::transcript::last_assistant_text;

use crate::discovery::AutoThreadDiscovery;

#[derive(Debug, Clone, Deserialize)]
pub struct HookEvent {
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub notification_type: Option<String>,
}

pub struct HookReceiver {
    monitor: Arc<SessionMonitor>,
    discovery: Arc<AutoThreadDiscovery>,
}

impl HookReceiver {
    pub fn new(monitor: Arc<SessionMonitor>, discovery: Arc<AutoThreadDiscovery>) -> Arc<Self> {
        Arc::new(Self { monitor, discovery })
    }

    /// Apply one hook event. `Err` carries the 400 message.
    pub async fn handle(&self, event: HookEvent) -> Result<(), String> {
        if event.hook_event_name.is_empty() {
            return Err("missing hook_event_name".into());
        }
        if event.session_id.is_empty() {
            return Err("missing session_id".into());
        }
        let provider = match event.provider.as_deref() {
            None | Some("") => Provider::Claude,
            Some(name) => {
                Provider::from_str(name).map_err(|_| format!("unknown provider: {name}"))?
            }
        };

        match event.hook_event_name.as_str() {
            "SessionStart" => {
                let hook_event = HookSessionEvent {
                    provider,
                    session_id: event.session_id.clone(),
                    cwd: event.cwd.clone(),
                    transcript_path: event.transcript_path.clone(),
                };
                let created = self.monitor.register_session(&hook_event);
                tracing::info!(session = %event.session_id, created, "hook: session start");
                if let Some(snapshot) = self.monitor.get(&event.session_id) {
                    self.discovery.on_session_start(&snapshot).await;
                }
            }
            "SessionEnd" => {
                self.monitor
                    .update_session_state(&event.session_id, SnapshotState::Completed);
            }
            "Stop" => {
                self.monitor
                    .update_activity_phase(&event.session_id, ActivityPhase::Interactable);
                if let Some(path) = event.transcript_path.clone() {
                    // Fire and forget: a slow or missing transcript must
                    // not hold up the hook response.
                    let discovery = self.discovery.clone();
                    let session_id = event.session_id.clone();
                    tokio::spawn(async move {
                        let text =
                            tokio::task::spawn_blocking(move || last_assistant_text(&path))
                                .await
                                .ok()
                                .flatten();
                        if let Some(text) = text {
                            discovery
                                .send_to_session_thread(provider, &session_id, &text)
                                .await;
                        }
                    });
                }
            }
            "UserPromptSubmit" => {
                self.monitor
                    .update_activity_phase(&event.session_id, ActivityPhase::Busy);
            }
            "Notification" => match event.notification_type.as_deref() {
                Some("permission_prompt") => {
                    self.monitor
                        .update_activity_phase(&event.session_id, ActivityPhase::WaitingPermission);
                }
                Some("idle_prompt") | Some("elicitation_dialog") => {
                    self.monitor
                        .update_activity_phase(&event.session_id, ActivityPhase::WaitingQuestion);
                }
                other => {
                    tracing::debug!(?other, "ignoring notification type");
                }
            },
            other => {
                tracing::debug!(event = %other, "ignoring unmapped hook event");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::throttle::{ChatExecutor, ThrottleQueue};
    use crate::chat::{ChatError, ChatPort, OutboundMessage};
    use crate::discovery::ChannelRegistry;
    use crate::routes::RouteStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sb_domain::config::{DiscoveryConfig, ThrottleConfig};
    use sb_sessions::tailer::OffsetStore;

    struct MockPort {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatPort for MockPort {
        async fn send(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ChatError> {
            self.sent
                .lock()
                .push((channel_id.to_string(), message.text.clone()));
            Ok(())
        }

        async fn create_thread(&self, _parent: &str, _name: &str) -> Result<String, ChatError> {
            Ok("thread-hook".into())
        }
    }

    #[async_trait]
    impl ChatExecutor for MockPort {
        async fn execute(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ChatError> {
            ChatPort::send(self, channel_id, message).await
        }
    }

    fn receiver(dir: &std::path::Path) -> (Arc<HookReceiver>, Arc<SessionMonitor>, Arc<MockPort>) {
        let monitor = Arc::new(SessionMonitor::new(
            vec![dir.join("projects")],
            None,
            2,
            Arc::new(OffsetStore::in_memory()),
        ));
        let port = Arc::new(MockPort {
            sent: Mutex::new(Vec::new()),
        });
        let throttle = ThrottleQueue::new(port.clone(), ThrottleConfig::default());
        let routes = Arc::new(RouteStore::in_memory().unwrap());
        let discovery = AutoThreadDiscovery::new(
            port.clone(),
            throttle,
            routes,
            ChannelRegistry::from_entries(vec![("/".into(), "chan".into())]),
            DiscoveryConfig::default(),
            dir,
        );
        (
            HookReceiver::new(monitor.clone(), discovery),
            monitor,
            port,
        )
    }

    fn event(name: &str, session: &str) -> HookEvent {
        HookEvent {
            hook_event_name: name.into(),
            session_id: session.into(),
            cwd: Some("/home/me/proj".into()),
            transcript_path: None,
            provider: Some("claude".into()),
            notification_type: None,
        }
    }

    #[tokio::test]
    async fn validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, _, _) = receiver(dir.path());

        let mut missing = event("SessionStart", "");
        missing.session_id = String::new();
        assert!(receiver.handle(missing).await.is_err());

        let mut unnamed = event("", "s-1");
        unnamed.hook_event_name = String::new();
        assert!(receiver.handle(unnamed).await.is_err());

        let mut bad_provider = event("SessionStart", "s-1");
        bad_provider.provider = Some("gemini".into());
        let err = receiver.handle(bad_provider).await.unwrap_err();
        assert!(err.contains("unknown provider"));
    }

    #[tokio::test]
    async fn session_start_registers_and_bridges() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, monitor, _) = receiver(dir.path());

        receiver.handle(event("SessionStart", "s-1")).await.unwrap();
        let snap = monitor.get("s-1").unwrap();
        assert_eq!(snap.state, SnapshotState::Active);
        assert_eq!(snap.activity_phase, Some(ActivityPhase::Busy));
    }

    #[tokio::test]
    async fn phase_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, monitor, _) = receiver(dir.path());
        receiver.handle(event("SessionStart", "s-1")).await.unwrap();

        let mut n = event("Notification", "s-1");
        n.notification_type = Some("permission_prompt".into());
        receiver.handle(n).await.unwrap();
        assert_eq!(
            monitor.get("s-1").unwrap().activity_phase,
            Some(ActivityPhase::WaitingPermission)
        );

        let mut n = event("Notification", "s-1");
        n.notification_type = Some("elicitation_dialog".into());
        receiver.handle(n).await.unwrap();
        assert_eq!(
            monitor.get("s-1").unwrap().activity_phase,
            Some(ActivityPhase::WaitingQuestion)
        );

        receiver.handle(event("Stop", "s-1")).await.unwrap();
        assert_eq!(
            monitor.get("s-1").unwrap().activity_phase,
            Some(ActivityPhase::Interactable)
        );

        receiver
            .handle(event("UserPromptSubmit", "s-1"))
            .await
            .unwrap();
        assert_eq!(
            monitor.get("s-1").unwrap().activity_phase,
            Some(ActivityPhase::Busy)
        );

        receiver.handle(event("SessionEnd", "s-1")).await.unwrap();
        let snap = monitor.get("s-1").unwrap();
        assert_eq!(snap.state, SnapshotState::Completed);
        assert!(snap.activity_phase.is_none());
    }

    #[tokio::test]
    async fn stop_forwards_last_assistant_text() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, _monitor, port) = receiver(dir.path());
        receiver.handle(event("SessionStart", "s-1")).await.unwrap();
        // Give discovery a beat to bind the thread.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let transcript = dir.path().join("t.jsonl");
        std::fs::write(
            &transcript,
            serde_json::json!({
                "type": "assistant",
                "message": { "content": [{ "type": "text", "text": "all done here" }] }
            })
            .to_string()
                + "\n",
        )
        .unwrap();

        let mut stop = event("Stop", "s-1");
        stop.transcript_path = Some(transcript);
        receiver.handle(stop).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let sent = port.sent.lock().clone();
        assert!(
            sent.iter().any(|(_, text)| text.contains("all done here")),
            "forwarded text missing: {sent:?}"
        );
    }
}
