//! Production action executor: shell commands, chat messages through the
//! throttle queue, and webhook POSTs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use sb_domain::{Error, Result};

use crate::chat::throttle::{SendOptions, ThrottleQueue};
use crate::chat::OutboundMessage;

use super::engine::ActionExecutor;
use super::model::{CronAction, CronJob};

pub struct GatewayActionExecutor {
    throttle: Arc<ThrottleQueue>,
    http: reqwest::Client,
}

impl GatewayActionExecutor {
    pub fn new(throttle: Arc<ThrottleQueue>) -> Self {
        Self {
            throttle,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ActionExecutor for GatewayActionExecutor {
    async fn execute(&self, job: &CronJob) -> Result<()> {
        match &job.action {
            CronAction::Shell { command, cwd } => {
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(command);
                if let Some(cwd) = cwd {
                    cmd.current_dir(cwd);
                }
                let output = cmd.output().await.map_err(Error::Io)?;
                if output.status.success() {
                    Ok(())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Err(Error::Other(format!(
                        "command exited with {:?}: {}",
                        output.status.code(),
                        stderr.trim()
                    )))
                }
            }
            CronAction::ChatMessage { channel_id, text } => self
                .throttle
                .send(
                    channel_id,
                    OutboundMessage::text(text.clone()),
                    SendOptions::default(),
                )
                .await
                .map_err(|e| Error::Other(e.to_string())),
            CronAction::Webhook { url } => {
                let payload = serde_json::json!({
                    "job_id": job.id,
                    "job_name": job.name,
                    "fired_at": Utc::now().to_rfc3339(),
                });
                let response = self
                    .http
                    .post(url)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| Error::Other(format!("webhook: {e}")))?;
                response
                    .error_for_status()
                    .map_err(|e| Error::Other(format!("webhook: {e}")))?;
                Ok(())
            }
        }
    }
}
