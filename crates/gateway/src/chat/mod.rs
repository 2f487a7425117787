//! Chat-platform seam.
//!
//! The concrete chat SDK is an external collaborator; Switchboard only
//! assumes a handful of primitives — send text, create a thread, attach an
//! action row or select menu, and deliver interaction events. Those
//! primitives are the [`ChatPort`] trait; everything outbound funnels
//! through the [`throttle::ThrottleQueue`].

pub mod limiter;
pub mod throttle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A button row or a select menu attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Component {
    /// Up to 5 buttons.
    Buttons { buttons: Vec<Button> },
    /// Up to 25 options.
    Select {
        custom_id: String,
        placeholder: String,
        options: Vec<SelectOption>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Button {
    pub custom_id: String,
    pub label: String,
    #[serde(default)]
    pub danger: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            components: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interactions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A user acting on a component we posted.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub custom_id: String,
    pub user_id: String,
    pub channel_id: String,
    /// Select menus deliver the chosen values.
    pub values: Vec<String>,
}

/// What we answer an interaction with (rendered ephemerally by the
/// platform layer).
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionReply {
    pub text: String,
    pub ephemeral: bool,
}

impl InteractionReply {
    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ephemeral: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors & the port
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The platform asked us to back off.
    #[error("rate limited for {retry_after_ms}ms (global: {global})")]
    RateLimited { retry_after_ms: u64, global: bool },

    #[error("chat api: {0}")]
    Api(String),
}

/// The primitives Switchboard assumes of the chat platform.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Deliver one message to a channel or thread.
    async fn send(&self, channel_id: &str, message: &OutboundMessage)
        -> Result<(), ChatError>;

    /// Create a thread under a parent channel; returns the thread id.
    async fn create_thread(&self, parent_channel_id: &str, name: &str)
        -> Result<String, ChatError>;
}

/// Port used when no platform adapter is plugged in: outbound traffic is
/// logged and acknowledged, threads get locally generated ids. Keeps the
/// whole pipeline runnable headless.
pub struct LoggingChatPort;

#[async_trait]
impl ChatPort for LoggingChatPort {
    async fn send(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ChatError> {
        tracing::info!(channel = %channel_id, text = %message.text, "chat send (no platform adapter)");
        Ok(())
    }

    async fn create_thread(&self, parent_channel_id: &str, name: &str) -> Result<String, ChatError> {
        let thread_id = format!("local-{}", &uuid::Uuid::new_v4().simple().to_string()[..10]);
        tracing::info!(parent = %parent_channel_id, name = %name, thread = %thread_id, "thread created (no platform adapter)");
        Ok(thread_id)
    }
}

#[async_trait]
impl throttle::ChatExecutor for LoggingChatPort {
    async fn execute(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ChatError> {
        self.send(channel_id, message).await
    }
}
