//! HTTP surface.
//!
//! Fixed endpoints: `/health`, the hook receiver, and the hook approval
//! bridge's respond/status pair. Additional routes are pluggable through
//! [`RouteSpec`] with `:param` segment matching, resolved in the router
//! fallback. An optional bearer token (SHA-256 compared in constant time)
//! guards everything under `/api`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::approvals::ResolveError;
use crate::hooks::{BridgeRequest, BridgeStatus, HookEvent};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pluggable routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RouteResponse {
    pub status: u16,
    pub body: Value,
}

impl RouteResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

pub type RouteHandler =
    Arc<dyn Fn(RouteRequest) -> BoxFuture<'static, RouteResponse> + Send + Sync>;

pub struct RouteSpec {
    pub method: String,
    pub path: String,
    pub handler: RouteHandler,
}

/// Match `/a/:id/b` style patterns, capturing `:param` segments.
pub fn match_path(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern_segments: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (pattern_segment, path_segment) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = pattern_segment.strip_prefix(':') {
            if path_segment.is_empty() {
                return None;
            }
            params.insert(name.to_string(), path_segment.to_string());
        } else if pattern_segment != path_segment {
            return None;
        }
    }
    Some(params)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn router(state: AppState, extra_routes: Vec<RouteSpec>) -> Router {
    let extra = Arc::new(extra_routes);
    let api = Router::new()
        .route("/api/hook", post(post_hook))
        .route("/api/hook/respond", post(post_hook_respond))
        .route("/api/hook/status/:id", get(get_hook_status))
        .route("/api/hook/gate", post(post_hook_gate))
        .route("/api/sessions", get(get_sessions))
        .route("/api/pending", get(get_pending))
        .route("/api/pending/:id/resolve", post(post_resolve_pending))
        .route("/api/cron/jobs", get(get_cron_jobs))
        .route("/api/cron/jobs/:id/runs", get(get_cron_runs))
        .route("/api/cron/status", get(get_cron_status))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/health", get(get_health))
        .merge(api)
        .fallback(extra_route_fallback)
        .layer(axum::Extension(extra))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(256))
        .with_state(state)
}

/// Bearer-token middleware. Disabled when no token is configured.
async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_hash) = &state.api_token_hash else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid or missing API token");
    }
    next.run(req).await
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "error": message })),
    )
        .into_response()
}

// ── Fixed endpoints ─────────────────────────────────────────────────

async fn get_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn post_hook(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    let event: HookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")),
    };
    match state.receiver.handle(event).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(message) => error_response(StatusCode::BAD_REQUEST, &message),
    }
}

/// Register a pre-tool-use gate; responds with the id to poll.
async fn post_hook_gate(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    let request: BridgeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")),
    };
    let id = state.bridge.create(request);
    Json(json!({ "ok": true, "id": id })).into_response()
}

async fn post_hook_respond(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = query.get("id") else {
        return error_response(StatusCode::BAD_REQUEST, "missing id");
    };
    let approved = query
        .get("approved")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if state.bridge.resolve(id, approved) {
        let verdict = if approved { "approved" } else { "denied" };
        Html(format!(
            "<html><body><h3>Request {verdict}.</h3>You can close this tab.</body></html>"
        ))
        .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Html("<html><body><h3>Unknown or already-processed request.</h3></body></html>".to_string()),
        )
            .into_response()
    }
}

async fn get_hook_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.bridge.wait_status(&id).await {
        Some((status, approved)) => {
            let status = match status {
                BridgeStatus::Pending => "pending",
                BridgeStatus::Resolved => "resolved",
                BridgeStatus::Completed => "completed",
            };
            let mut body = json!({ "status": status });
            if let Some(approved) = approved {
                body["approved"] = json!(approved);
            }
            Json(body).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "unknown gate id"),
    }
}

async fn get_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.monitor.snapshots() }))
}

async fn get_pending(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "pending": state.broker.list_pending() }))
}

async fn post_resolve_pending(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    #[derive(serde::Deserialize, Default)]
    struct ResolveBody {
        decision: Option<String>,
        actor_user_id: Option<String>,
    }
    let body: ResolveBody = if body.is_empty() {
        ResolveBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}"))
            }
        }
    };

    match state
        .broker
        .resolve_pending(&id, body.decision.as_deref(), body.actor_user_id.as_deref())
    {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(ResolveError::NotFound) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(e @ ResolveError::InvalidRequest(_)) => {
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e @ ResolveError::InvalidDecision(_)) => {
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
    }
}

async fn get_cron_jobs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "jobs": state.cron.list() }))
}

async fn get_cron_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(50);
    Json(json!({ "runs": state.cron.runs(&id, limit) }))
}

async fn get_cron_status(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.cron.status()).unwrap_or_default())
}

// ── Pluggable-route fallback ────────────────────────────────────────

async fn extra_route_fallback(
    axum::Extension(extra): axum::Extension<Arc<Vec<RouteSpec>>>,
    req: Request<Body>,
) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| {
            url_decode_pairs(q)
        })
        .unwrap_or_default();

    for spec in extra.iter() {
        if !spec.method.eq_ignore_ascii_case(&method) {
            continue;
        }
        let Some(params) = match_path(&spec.path, &path) else {
            continue;
        };
        let body = axum::body::to_bytes(req.into_body(), 1024 * 1024)
            .await
            .ok()
            .filter(|b| !b.is_empty())
            .and_then(|b| serde_json::from_slice(&b).ok());
        let response = (spec.handler)(RouteRequest {
            params,
            query,
            body,
        })
        .await;
        let status =
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, Json(response.body)).into_response();
    }
    error_response(StatusCode::NOT_FOUND, "no such route")
}

fn url_decode_pairs(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), v.replace('+', " ")))
        })
        .collect()
}
