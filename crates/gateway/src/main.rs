use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use sb_domain::config::{Config, ConfigSeverity};
use sb_gateway::approvals::{ApprovalBroker, BrokerRequestHandler};
use sb_gateway::chat::throttle::ThrottleQueue;
use sb_gateway::chat::LoggingChatPort;
use sb_gateway::cli::{Cli, Command};
use sb_gateway::cron::{CronScheduler, GatewayActionExecutor};
use sb_gateway::discovery::{AutoThreadDiscovery, ChannelRegistry};
use sb_gateway::hooks::{HookApprovalBridge, HookReceiver};
use sb_gateway::lifecycle::{spawn_lifecycle_tail, LifecycleStreamStore};
use sb_gateway::routes::RouteStore;
use sb_gateway::state::AppState;
use sb_providers::app_server::AppServerProvider;
use sb_providers::claude_cli::ClaudeCliProvider;
use sb_providers::SessionManager;
use sb_sessions::monitor::SessionMonitor;
use sb_sessions::tailer::OffsetStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to run when no subcommand is given.
        None | Some(Command::Run) => {
            init_tracing();
            let (config, config_path) = sb_gateway::cli::load_config(cli.config.as_ref())?;
            if let Some(path) = &config_path {
                tracing::info!(path = %path.display(), "config loaded");
            } else {
                tracing::info!("no config file found, using defaults");
            }
            run(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let (config, _) = sb_gateway::cli::load_config(cli.config.as_ref())?;
            if !sb_gateway::cli::doctor(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("switchboard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sb_gateway=debug")),
        )
        .init();
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("switchboard starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let state_dir = config.state.dir.clone();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    // ── Thread-route store ───────────────────────────────────────────
    let routes = Arc::new(
        RouteStore::open(&state_dir.join("deploy.db")).context("opening route store")?,
    );
    tracing::info!("route store ready");

    // ── Chat egress ──────────────────────────────────────────────────
    let port = Arc::new(LoggingChatPort);
    let throttle = ThrottleQueue::new(port.clone(), config.throttle.clone());
    tracing::info!(
        merge_window_ms = config.throttle.merge_window_ms,
        channel_cap = config.throttle.channel_max_queue_size,
        "throttle queue ready"
    );

    // ── Session monitor ──────────────────────────────────────────────
    let offsets = Arc::new(OffsetStore::open(state_dir.join("tailer-offsets.json")));
    let mut claude_roots = SessionMonitor::default_roots();
    claude_roots.extend(config.monitor.extra_transcript_roots.clone());
    let codex_root = dirs::home_dir().map(|h| h.join(".codex").join("sessions"));
    let monitor = Arc::new(SessionMonitor::new(
        claude_roots,
        codex_root,
        config.monitor.codex_scan_days,
        offsets.clone(),
    ));
    tracing::info!("session monitor ready");

    // ── Auto-thread discovery ────────────────────────────────────────
    let registry = match config.channels_file() {
        Some(path) => ChannelRegistry::load(&path),
        None => ChannelRegistry::default(),
    };
    let discovery = AutoThreadDiscovery::new(
        port.clone(),
        throttle.clone(),
        routes.clone(),
        registry,
        config.discovery.clone(),
        &state_dir,
    );
    {
        let discovery = discovery.clone();
        monitor.on_refresh(Arc::new(move |snapshots| {
            let discovery = discovery.clone();
            Box::pin(async move { discovery.on_monitor_refresh(snapshots).await })
        }));
    }
    tracing::info!("auto-thread discovery subscribed");

    // ── Approvals ────────────────────────────────────────────────────
    let broker = ApprovalBroker::new(
        throttle.clone(),
        config.approvals.custom_id_prefix.clone(),
        config.approvals.max_pending,
    );
    let handler = BrokerRequestHandler::new(
        broker.clone(),
        routes.clone(),
        config.discovery.fallback_channel.clone(),
    );

    // ── Provider session layer ───────────────────────────────────────
    let sessions = Arc::new(SessionManager::new());
    sessions
        .register_provider(Arc::new(ClaudeCliProvider::new(
            config.providers.claude_bin.clone(),
            config.providers.effective_max_concurrent(),
        )))
        .await;
    sessions
        .register_provider(Arc::new(AppServerProvider::with_handler(
            config.providers.codex_app_server_bin.clone(),
            handler,
        )))
        .await;
    tracing::info!(
        providers = sessions.list_providers().await.len(),
        max_concurrent = config.providers.effective_max_concurrent(),
        "session manager ready"
    );

    // ── Hook surface ─────────────────────────────────────────────────
    let bridge = HookApprovalBridge::new(
        throttle.clone(),
        config.discovery.fallback_channel.clone(),
        config.approvals.custom_id_prefix.clone(),
    );
    let receiver = HookReceiver::new(monitor.clone(), discovery.clone());

    // ── Cron ─────────────────────────────────────────────────────────
    let cron = CronScheduler::new(
        &state_dir,
        Arc::new(GatewayActionExecutor::new(throttle.clone())),
        config.cron.clone(),
    );
    cron.start().await.context("starting cron scheduler")?;

    // ── Lifecycle stream ─────────────────────────────────────────────
    let lifecycle_cancel = tokio_util::sync::CancellationToken::new();
    match LifecycleStreamStore::open(&state_dir.join("lifecycle-stream.db")) {
        Ok(lifecycle) => {
            spawn_lifecycle_tail(
                lifecycle,
                state_dir.join("lifecycle.jsonl"),
                offsets.clone(),
                Duration::from_millis(config.monitor.poll_ms),
                lifecycle_cancel.clone(),
            );
            tracing::info!("lifecycle stream tail running");
        }
        Err(e) => tracing::warn!(error = %e, "lifecycle stream store unavailable"),
    }

    // ── Background monitor driving ───────────────────────────────────
    monitor.refresh().await;
    let _refresh_loop =
        monitor.spawn_interval_refresh(Duration::from_secs(config.monitor.refresh_interval_secs));
    let _watch_loop = monitor.spawn_watcher(Duration::from_secs(config.monitor.watch_debounce_secs));
    tracing::info!("monitor refresh loops running");

    // ── Periodic auto-threads export ─────────────────────────────────
    {
        let routes = routes.clone();
        let export_path = state_dir.join("auto-threads.json");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = routes.export_json(&export_path) {
                    tracing::warn!(error = %e, "auto-threads export failed");
                }
            }
        });
    }

    // ── API token (read once, hashed) ────────────────────────────────
    let api_token_hash = match std::env::var(&config.server.api_token_env) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var = %config.server.api_token_env, "API bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = %config.server.api_token_env,
                "API bearer-token auth disabled"
            );
            None
        }
    };

    // ── HTTP ─────────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        sessions,
        monitor,
        throttle,
        discovery,
        broker,
        bridge,
        receiver,
        cron,
        routes,
        api_token_hash,
    };
    let app = sb_gateway::http::router(state, Vec::new());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "switchboard listening");

    axum::serve(listener, app).await.context("axum server error")?;
    lifecycle_cancel.cancel();
    Ok(())
}
