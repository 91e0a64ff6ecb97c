use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tracing::error;

use crate::api::ApiState;
use crate::models::BreakerState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/startup", get(startup))
        .route("/health/detailed", get(health_detailed))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
    uptime_secs: i64,
    dependencies: BTreeMap<String, DependencyStatus>,
}

#[derive(Debug, Serialize)]
struct DependencyStatus {
    ok: bool,
    detail: Option<String>,
}

impl HealthResponse {
    fn ok(state: &ApiState) -> Self {
        Self {
            status: "ok",
            timestamp: Utc::now(),
            uptime_secs: (Utc::now() - state.started_at).num_seconds(),
            dependencies: BTreeMap::new(),
        }
    }

    fn into_response_with_status(self, ok: bool) -> Response {
        let code = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
        (code, Json(self)).into_response()
    }
}

/// Always-OK liveness probe: process is up and serving requests.
async fn health(axum::extract::State(state): axum::extract::State<ApiState>) -> Response {
    HealthResponse::ok(&state).into_response_with_status(true)
}

/// Readiness: can the message store currently be queried.
async fn ready(axum::extract::State(state): axum::extract::State<ApiState>) -> Response {
    let mut response = HealthResponse::ok(&state);

    let store_ok = state.message_store.status_counts().await.is_ok();
    response.dependencies.insert(
        "message_store".to_string(),
        DependencyStatus { ok: store_ok, detail: (!store_ok).then(|| "query failed".to_string()) },
    );

    if !store_ok {
        response.status = "fail";
        error!("readiness probe: message store unreachable");
    }

    response.into_response_with_status(store_ok)
}

/// Startup: workspace registry has loaded at least one snapshot and every
/// enabled workspace has the credentials its configured provider needs.
async fn startup(axum::extract::State(state): axum::extract::State<ApiState>) -> Response {
    let mut response = HealthResponse::ok(&state);

    let snapshot = state.registry.snapshot();
    let invalid: Vec<String> =
        snapshot.workspaces.values().filter(|w| w.enabled).filter_map(|w| w.validate().err()).collect();
    let ok = invalid.is_empty();

    response.dependencies.insert(
        "workspace_registry".to_string(),
        DependencyStatus { ok, detail: (!ok).then(|| invalid.join("; ")) },
    );

    if !ok {
        response.status = "fail";
    }

    response.into_response_with_status(ok)
}

/// Full dependency breakdown: store, workspace credentials, and every
/// provider's circuit breaker state.
async fn health_detailed(axum::extract::State(state): axum::extract::State<ApiState>) -> Response {
    let mut response = HealthResponse::ok(&state);
    let mut all_ok = true;

    let store_ok = state.message_store.status_counts().await.is_ok();
    all_ok &= store_ok;
    response.dependencies.insert(
        "message_store".to_string(),
        DependencyStatus { ok: store_ok, detail: (!store_ok).then(|| "query failed".to_string()) },
    );

    let snapshot = state.registry.snapshot();
    let invalid: Vec<String> =
        snapshot.workspaces.values().filter(|w| w.enabled).filter_map(|w| w.validate().err()).collect();
    let workspaces_ok = invalid.is_empty();
    all_ok &= workspaces_ok;
    response.dependencies.insert(
        "workspace_registry".to_string(),
        DependencyStatus { ok: workspaces_ok, detail: (!workspaces_ok).then(|| invalid.join("; ")) },
    );

    for health in state.breakers.snapshot() {
        let ok = health.state != BreakerState::Open;
        all_ok &= ok;
        response.dependencies.insert(
            format!("breaker_{:?}", health.provider).to_lowercase(),
            DependencyStatus { ok, detail: Some(format!("{:?}", health.state)) },
        );
    }

    if !all_ok {
        response.status = "fail";
    }

    response.into_response_with_status(all_ok)
}
