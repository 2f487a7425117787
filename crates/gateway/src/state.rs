use std::sync::Arc;

use sb_domain::config::Config;
use sb_providers::SessionManager;
use sb_sessions::monitor::SessionMonitor;

use crate::approvals::ApprovalBroker;
use crate::chat::throttle::ThrottleQueue;
use crate::cron::CronScheduler;
use crate::discovery::AutoThreadDiscovery;
use crate::hooks::{HookApprovalBridge, HookReceiver};
use crate::routes::RouteStore;

/// Shared application state handed to every HTTP handler.
///
/// Grouped by concern:
/// - **Sessions** — provider pool, monitor
/// - **Chat egress** — throttle queue, discovery
/// - **Interactions** — approval broker, hook bridge, hook receiver
/// - **Jobs** — cron scheduler
/// - **Persistence** — thread-route store
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Sessions ──────────────────────────────────────────────────────
    pub sessions: Arc<SessionManager>,
    pub monitor: Arc<SessionMonitor>,

    // ── Chat egress ───────────────────────────────────────────────────
    pub throttle: Arc<ThrottleQueue>,
    pub discovery: Arc<AutoThreadDiscovery>,

    // ── Interactions ──────────────────────────────────────────────────
    pub broker: Arc<ApprovalBroker>,
    pub bridge: Arc<HookApprovalBridge>,
    pub receiver: Arc<HookReceiver>,

    // ── Jobs ──────────────────────────────────────────────────────────
    pub cron: Arc<CronScheduler>,

    // ── Persistence ───────────────────────────────────────────────────
    pub routes: Arc<RouteStore>,

    /// SHA-256 of the API bearer token (read once at startup).
    /// `None` = no auth (single-owner local deployment).
    pub api_token_hash: Option<Vec<u8>>,
}
