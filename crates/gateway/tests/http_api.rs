//! HTTP surface tests: health, hook validation, the gate respond/status
//! pair, and pluggable `:param` routes.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use sb_domain::config::Config;
use sb_gateway::approvals::ApprovalBroker;
use sb_gateway::chat::throttle::ThrottleQueue;
use sb_gateway::chat::LoggingChatPort;
use sb_gateway::cron::CronScheduler;
use sb_gateway::discovery::{AutoThreadDiscovery, ChannelRegistry};
use sb_gateway::hooks::{HookApprovalBridge, HookReceiver};
use sb_gateway::http::{router, RouteRequest, RouteResponse, RouteSpec};
use sb_gateway::routes::RouteStore;
use sb_gateway::state::AppState;
use sb_providers::SessionManager;
use sb_sessions::monitor::SessionMonitor;
use sb_sessions::tailer::OffsetStore;

struct NoopAction;

#[async_trait::async_trait]
impl sb_gateway::cron::ActionExecutor for NoopAction {
    async fn execute(&self, _job: &sb_gateway::cron::CronJob) -> sb_domain::Result<()> {
        Ok(())
    }
}

fn test_state(dir: &std::path::Path) -> AppState {
    let config = Arc::new(Config::default());
    let port = Arc::new(LoggingChatPort);
    let throttle = ThrottleQueue::new(port.clone(), config.throttle.clone());
    let monitor = Arc::new(SessionMonitor::new(
        vec![dir.join("projects")],
        None,
        2,
        Arc::new(OffsetStore::in_memory()),
    ));
    let routes = Arc::new(RouteStore::in_memory().unwrap());
    let discovery = AutoThreadDiscovery::new(
        port,
        throttle.clone(),
        routes.clone(),
        ChannelRegistry::default(),
        config.discovery.clone(),
        dir,
    );
    let broker = ApprovalBroker::new(throttle.clone(), "sbx".into(), 1_000);
    let bridge = HookApprovalBridge::new(throttle.clone(), None, "sbx".into());
    let receiver = HookReceiver::new(monitor.clone(), discovery.clone());
    let cron = CronScheduler::new(dir, Arc::new(NoopAction), config.cron.clone());

    AppState {
        config,
        sessions: Arc::new(SessionManager::new()),
        monitor,
        throttle,
        discovery,
        broker,
        bridge,
        receiver,
        cron,
        routes,
        api_token_hash: None,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()), Vec::new());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "ok" }));
}

#[tokio::test]
async fn hook_accepts_valid_and_rejects_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let app = router(state.clone(), Vec::new());

    let valid = json!({
        "hook_event_name": "SessionStart",
        "session_id": "s-http-1",
        "cwd": "/home/me/proj",
        "provider": "claude"
    });
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/hook")
                .header("content-type", "application/json")
                .body(Body::from(valid.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "ok": true }));
    assert!(state.monitor.get("s-http-1").is_some());

    // Unknown provider → 400.
    let bad_provider = json!({
        "hook_event_name": "SessionStart",
        "session_id": "s-2",
        "provider": "gemini"
    });
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/hook")
                .body(Body::from(bad_provider.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("unknown provider"));

    // Broken JSON → 400.
    let response = app
        .oneshot(
            Request::post("/api/hook")
                .body(Body::from("{ not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn gate_respond_and_status_flow() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let app = router(state.clone(), Vec::new());

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/hook/gate")
                .body(Body::from(
                    json!({ "tool_name": "Bash", "detail": "rm -rf /", "timeout_ms": 0 })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    // Browser button approves it.
    let response = app
        .clone()
        .oneshot(
            Request::post(format!("/api/hook/respond?id={id}&approved=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // First poll observes the resolution…
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/hook/status/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "resolved");
    assert_eq!(body["approved"], true);

    // …and a late poll sees the completed cache entry.
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/hook/status/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "completed");

    // Unknown ids are 404.
    let response = app
        .oneshot(
            Request::get("/api/hook/status/doesnotexist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pluggable_route_with_params() {
    let dir = tempfile::tempdir().unwrap();
    let extra = vec![RouteSpec {
        method: "GET".into(),
        path: "/api/echo/:name".into(),
        handler: Arc::new(|req: RouteRequest| {
            Box::pin(async move {
                RouteResponse::ok(json!({
                    "name": req.params.get("name"),
                    "q": req.query.get("q"),
                }))
            })
        }),
    }];
    let app = router(test_state(dir.path()), extra);

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/echo/world?q=hi")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["name"], "world");
    assert_eq!(body["q"], "hi");

    let response = app
        .oneshot(Request::get("/api/nowhere").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cron_endpoints_list_jobs_and_runs() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let added = state
        .cron
        .add(sb_gateway::cron::NewJob {
            name: "hourly".into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            source: sb_gateway::cron::JobSource::User,
            timeout_ms: None,
            schedule: sb_gateway::cron::CronSchedule::Every {
                every_ms: 3_600_000,
                anchor_ms: None,
            },
            action: sb_gateway::cron::CronAction::Shell {
                command: "true".into(),
                cwd: None,
            },
        })
        .await
        .unwrap();
    let app = router(state.clone(), Vec::new());

    let response = app
        .clone()
        .oneshot(Request::get("/api/cron/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

    let response = app
        .oneshot(
            Request::get(format!("/api/cron/jobs/{}/runs?limit=5", added.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["runs"].as_array().unwrap().is_empty());
    state.cron.stop();
}

#[tokio::test]
async fn bearer_auth_guards_api_but_not_health() {
    use sha2::{Digest, Sha256};
    let dir = tempfile::tempdir().unwrap();
    let mut state = test_state(dir.path());
    state.api_token_hash = Some(Sha256::digest(b"sekrit").to_vec());
    let app = router(state, Vec::new());

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::get("/api/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::get("/api/sessions")
                .header("authorization", "Bearer sekrit")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn pending_resolution_errors_are_typed() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()), Vec::new());

    let response = app
        .oneshot(
            Request::post("/api/pending/nope/resolve")
                .body(Body::from(json!({ "decision": "accept" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "not_found");
}
