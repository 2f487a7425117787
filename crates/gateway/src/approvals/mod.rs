//! Approval / interaction brokering.

pub mod broker;
pub mod custom_id;

use std::sync::Arc;

use async_trait::async_trait;

use sb_domain::snapshot::Provider;
use sb_providers::app_server::{
    default_answers, ApprovalDecision, CommandApprovalRequest, FileChangeApprovalRequest,
    ServerRequestHandler, ToolUserInputRequest, UserInputAnswers,
};

use crate::routes::RouteStore;

pub use broker::{ApprovalBroker, PendingInfo, PendingKind, ResolveError};

/// Bridges adapter server-requests to the chat broker: the backend thread
/// id is resolved to its chat thread through the route store; without a
/// route (and no fallback channel) the default decline/first-option
/// behavior applies.
pub struct BrokerRequestHandler {
    broker: Arc<ApprovalBroker>,
    routes: Arc<RouteStore>,
    fallback_channel: Option<String>,
}

impl BrokerRequestHandler {
    pub fn new(
        broker: Arc<ApprovalBroker>,
        routes: Arc<RouteStore>,
        fallback_channel: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            routes,
            fallback_channel,
        })
    }

    fn resolve_channel(&self, backend_thread_id: &str) -> Option<(String, Option<String>)> {
        if let Ok(Some(route)) = self
            .routes
            .find_by_session(Provider::CodexAppServer, backend_thread_id)
        {
            return Some((route.thread_id, route.owner_user_id));
        }
        self.fallback_channel
            .clone()
            .map(|channel| (channel, None))
    }
}

#[async_trait]
impl ServerRequestHandler for BrokerRequestHandler {
    async fn on_command_approval(&self, req: CommandApprovalRequest) -> ApprovalDecision {
        match self.resolve_channel(&req.thread_id) {
            Some((channel, owner)) => {
                self.broker
                    .request_command_approval(&channel, owner, &req)
                    .await
            }
            None => {
                tracing::warn!(thread_id = %req.thread_id, "no chat route for approval, declining");
                ApprovalDecision::Decline
            }
        }
    }

    async fn on_file_change_approval(&self, req: FileChangeApprovalRequest) -> ApprovalDecision {
        match self.resolve_channel(&req.thread_id) {
            Some((channel, owner)) => {
                self.broker
                    .request_file_change_approval(&channel, owner, &req)
                    .await
            }
            None => ApprovalDecision::Decline,
        }
    }

    async fn on_tool_user_input(&self, req: ToolUserInputRequest) -> UserInputAnswers {
        match self.resolve_channel(&req.thread_id) {
            Some((channel, owner)) => {
                self.broker
                    .request_tool_user_input(&channel, owner, &req)
                    .await
            }
            None => default_answers(&req),
        }
    }
}
