//! HTTP surface: internal endpoints plus the catch-all dispatch route.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};

use ols_core::Config;

use crate::cache::CacheRegistry;
use crate::dispatch::Dispatcher;
use crate::sync::SyncCoordinator;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    /// `None` in development mode.
    sync: Option<Arc<SyncCoordinator>>,
    cache: Arc<CacheRegistry>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        dispatcher: Arc<Dispatcher>,
        sync: Option<Arc<SyncCoordinator>>,
        cache: Arc<CacheRegistry>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            sync,
            cache,
            started_at: Instant::now(),
        }
    }
}

const API_PREFIX: &str = "/_internal/api";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/_internal/health", get(health))
        .route("/_internal/metric", get(metric))
        .route("/_internal/api", any(api_root))
        .route("/_internal/api/{*method}", any(api))
        .fallback(dispatch)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "message": "ok" }))
}

async fn metric(State(state): State<AppState>) -> Json<Value> {
    let mode = if state.config.is_dev() { "dev" } else { "production" };
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "mode": mode,
        "cache_entries": state.cache.len(),
        "sync": state.sync.as_ref().map(|sync| sync.stats()),
        "backend": state.dispatcher.backend().metrics(),
    }))
}

async fn api_root(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match authorize(&state, &query) {
        Err(denied) => denied,
        Ok(()) => message(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn api(
    State(state): State<AppState>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&state, &query) {
        return denied;
    }

    match method.trim_end_matches('/') {
        "status" => {
            let status = mode_status(&state).await;
            Json(json!({ "status": status, "env": state.config.public_env() })).into_response()
        }
        "update" => match &state.sync {
            None => (StatusCode::CONFLICT, Json(json!({ "mode": "dev" }))).into_response(),
            Some(sync) => {
                tracing::info!("update requested through the api");
                let outcome = sync.check_and_update().await;
                Json(outcome).into_response()
            }
        },
        _ => message(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Anything under the api prefix that no api route matched, e.g.
/// `/_internal/apifoo`, is still an api call and never reaches a service.
async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    if request.uri().path().starts_with(API_PREFIX) {
        let query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
            .map(|Query(query)| query)
            .unwrap_or_default();
        return match authorize(&state, &query) {
            Err(denied) => denied,
            Ok(()) => message(StatusCode::NOT_FOUND, "not found"),
        };
    }
    state.dispatcher.handle(request).await
}

/// The api is hidden entirely when no key is configured.
fn authorize(state: &AppState, query: &HashMap<String, String>) -> Result<(), Response> {
    let Some(expected) = state.config.api_key.as_deref() else {
        return Err(message(StatusCode::NOT_FOUND, "not found"));
    };
    if query.get("key").map(String::as_str) != Some(expected) {
        tracing::warn!("api call with an invalid key");
        return Err(message(StatusCode::FORBIDDEN, "invalid api key"));
    }
    Ok(())
}

async fn mode_status(state: &AppState) -> Value {
    match &state.sync {
        None => json!({ "mode": "dev" }),
        Some(sync) => {
            let commit = sync.local_commit().await;
            json!({ "mode": "production", "commit": commit })
        }
    }
}

fn message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}
