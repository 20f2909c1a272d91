//! Execution subsystem seam.
//!
//! The dispatcher only knows these traits. [`crate::process::ProcessBackend`]
//! is the adapter shipped with the daemon; tests use in-memory fakes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Everything needed to create (or look up) the unit serving one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitConfig {
    pub service_path: PathBuf,
    pub entry_point_path: PathBuf,
    pub memory_limit_mb: u64,
    pub wall_clock_timeout: Duration,
    pub cpu_time_soft_limit: Duration,
    pub cpu_time_hard_limit: Duration,
    /// Import map handed to the runtime, if any.
    pub config_path: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
    /// Discard any existing unit for `service_path` and start a new one.
    pub force_recreate: bool,
    pub network_access_disabled: bool,
}

/// Errors surfaced by the execution subsystem.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// The supervisor pre-empted the request (CPU or wall-clock limit).
    #[error("request cancelled by the supervisor: {0}")]
    Cancelled(String),

    /// The unit could not be started.
    #[error("failed to start worker: {0}")]
    Spawn(String),

    /// The unit started but never became reachable.
    #[error("worker did not become ready: {0}")]
    NotReady(String),

    /// The unit was reachable but the exchange failed.
    #[error("worker request failed: {0}")]
    Upstream(String),

    /// The unit exited before or while handling the request.
    #[error("worker terminated: {0}")]
    Terminated(String),
}

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled(_))
    }
}

/// Creates or reuses isolated, resource-limited units.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Return the unit for `config.service_path`, creating it when none is
    /// alive or when `config.force_recreate` is set.
    async fn create_or_reuse(
        &self,
        config: UnitConfig,
    ) -> Result<Arc<dyn ExecutionUnit>, ExecError>;

    /// Backend-specific runtime metrics.
    fn metrics(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// A running unit able to answer HTTP requests for one service.
#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    async fn forward(
        &self,
        request: Request<Body>,
        cancel: CancellationToken,
    ) -> Result<Response<Body>, ExecError>;
}
