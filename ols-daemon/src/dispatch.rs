//! Per-request orchestration: readiness, resolution, cache, execution.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ols_core::config::API_KEY_VAR;
use ols_core::{CacheEntry, ResourceLimits};

use crate::cache::CacheRegistry;
use crate::exec::{ExecError, ExecutionBackend, UnitConfig};
use crate::resolver::{ResolveError, ServiceResolver};
use crate::sync::SyncCoordinator;

/// Routes one inbound request to the unit serving its service.
pub struct Dispatcher {
    /// `None` in development mode: there is no mirror to wait for.
    sync: Option<Arc<SyncCoordinator>>,
    cache: Arc<CacheRegistry>,
    resolver: ServiceResolver,
    backend: Arc<dyn ExecutionBackend>,
    limits: ResourceLimits,
    environment: Vec<(String, String)>,
}

impl Dispatcher {
    pub fn new(
        sync: Option<Arc<SyncCoordinator>>,
        cache: Arc<CacheRegistry>,
        resolver: ServiceResolver,
        backend: Arc<dyn ExecutionBackend>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            sync,
            cache,
            resolver,
            backend,
            limits,
            environment: Vec::new(),
        }
    }

    /// Variables passed to every unit.
    pub fn with_environment(mut self, environment: Vec<(String, String)>) -> Self {
        self.environment = environment;
        self
    }

    pub fn resolver(&self) -> &ServiceResolver {
        &self.resolver
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    pub async fn handle(&self, request: Request<Body>) -> Response {
        if let Some(sync) = &self.sync {
            sync.wait_until_ready().await;
        }

        let service = match self.resolver.resolve(request.uri().path()).await {
            Ok(service) => service,
            Err(ResolveError::MissingServiceName) => {
                return msg_response(StatusCode::BAD_REQUEST, "missing function name in request");
            }
            Err(ResolveError::ServiceNotFound { name }) => {
                tracing::debug!(service = %name, "service not found");
                return msg_response(StatusCode::NOT_FOUND, "not found");
            }
        };

        let (config_path, force_recreate) = match self.cache.get(&service.name) {
            Some(entry) => (entry.config_path, false),
            None => (
                self.resolver
                    .locate_import_map(&service.directory_path)
                    .await,
                true,
            ),
        };
        self.cache.put(
            service.name.clone(),
            CacheEntry {
                service_name: service.name.clone(),
                config_path: config_path.clone(),
            },
        );

        let config = UnitConfig {
            service_path: service.directory_path.clone(),
            entry_point_path: service.entry_point_path.clone(),
            memory_limit_mb: self.limits.memory_limit_mb,
            wall_clock_timeout: self.limits.wall_clock_timeout,
            cpu_time_soft_limit: self.limits.cpu_time_soft_limit,
            cpu_time_hard_limit: self.limits.cpu_time_hard_limit,
            config_path,
            environment: self.environment.clone(),
            force_recreate,
            network_access_disabled: false,
        };

        match self.call_unit(config, request).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_cancelled() {
                    // Not retried: the request body has already been consumed.
                    tracing::warn!(service = %service.name, error = %err, "request cancelled by supervisor");
                } else {
                    tracing::error!(service = %service.name, error = %err, "worker request failed");
                }
                msg_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        }
    }

    async fn call_unit(
        &self,
        config: UnitConfig,
        request: Request<Body>,
    ) -> Result<Response, ExecError> {
        let unit = self.backend.create_or_reuse(config).await?;
        // Never cancelled here; units enforce their own CPU and wall-clock limits.
        let cancel = CancellationToken::new();
        unit.forward(request, cancel).await
    }
}

/// Process environment minus the API key.
pub fn forwarded_environment() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(key, _)| key != API_KEY_VAR)
        .collect()
}

fn msg_response(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "msg": msg }))).into_response()
}
