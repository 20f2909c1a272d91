//! [`ExecutionBackend`] that runs each service as a supervised child process.
//!
//! A unit is `<runner…> [--import-map <path>] <entry point>` started in the
//! service directory with `PORT` set. Requests are proxied to
//! `127.0.0.1:<PORT>`. A supervisor task kills the child at the wall-clock
//! limit; requests in flight at that moment fail with
//! [`ExecError::Cancelled`]. A unit replaced by a newer one keeps serving the
//! requests it already accepted and is killed once they have all returned.
//! CPU and memory ceilings are passed to the runner through `OLS_*` variables.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{Request, Response};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::exec::{ExecError, ExecutionBackend, ExecutionUnit, UnitConfig};

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Largest request body forwarded to a unit.
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// One child process per service directory.
pub struct ProcessBackend {
    runner: Vec<String>,
    client: reqwest::Client,
    startup_timeout: Duration,
    units: Mutex<HashMap<PathBuf, Arc<ProcessUnit>>>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl ProcessBackend {
    /// `runner` is the program and its leading arguments, e.g.
    /// `["deno", "run", "--allow-all"]`.
    pub fn new(runner: Vec<String>) -> Self {
        Self {
            runner,
            client: reqwest::Client::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            units: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// How long a fresh unit may take to accept connections.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn command_for(&self, config: &UnitConfig, port: u16) -> Result<Command, ExecError> {
        let (program, args) = self
            .runner
            .split_first()
            .ok_or_else(|| ExecError::Spawn("no runner configured".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(map) = &config.config_path {
            cmd.arg("--import-map").arg(map);
        }
        cmd.arg(&config.entry_point_path)
            .current_dir(&config.service_path)
            .env_clear()
            .envs(config.environment.iter().cloned())
            .env("PORT", port.to_string())
            .env("OLS_MEMORY_LIMIT_MB", config.memory_limit_mb.to_string())
            .env(
                "OLS_CPU_SOFT_LIMIT_MS",
                config.cpu_time_soft_limit.as_millis().to_string(),
            )
            .env(
                "OLS_CPU_HARD_LIMIT_MS",
                config.cpu_time_hard_limit.as_millis().to_string(),
            )
            .env(
                "OLS_NET_ACCESS_DISABLED",
                if config.network_access_disabled { "1" } else { "0" },
            )
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn spawn_unit(&self, config: &UnitConfig) -> Result<Arc<ProcessUnit>, ExecError> {
        let port = free_port()?;
        let mut cmd = self.command_for(config, port)?;
        let child = cmd
            .spawn()
            .map_err(|err| ExecError::Spawn(format!("{}: {err}", self.runner.join(" "))))?;

        tracing::info!(
            service = %config.service_path.display(),
            port,
            pid = child.id().unwrap_or_default(),
            "worker started",
        );

        let unit = Arc::new(ProcessUnit::new(
            config.service_path.clone(),
            port,
            self.client.clone(),
            self.startup_timeout,
        ));
        tokio::spawn(supervise(child, Arc::clone(&unit), config.wall_clock_timeout));
        Ok(unit)
    }

    fn alive_units(&self) -> usize {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|unit| unit.is_alive())
            .count()
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn create_or_reuse(
        &self,
        config: UnitConfig,
    ) -> Result<Arc<dyn ExecutionUnit>, ExecError> {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);

        if !config.force_recreate {
            if let Some(unit) = units.get(&config.service_path) {
                if unit.is_alive() {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    let unit: Arc<dyn ExecutionUnit> = unit.clone();
                    return Ok(unit);
                }
            }
        }

        if let Some(old) = units.remove(&config.service_path) {
            old.retire();
        }
        let unit = self.spawn_unit(&config)?;
        units.insert(config.service_path.clone(), Arc::clone(&unit));
        self.created.fetch_add(1, Ordering::Relaxed);
        let unit: Arc<dyn ExecutionUnit> = unit;
        Ok(unit)
    }

    fn metrics(&self) -> serde_json::Value {
        json!({
            "units_alive": self.alive_units(),
            "units_created": self.created.load(Ordering::Relaxed),
            "units_reused": self.reused.load(Ordering::Relaxed),
        })
    }
}

/// A child process listening on `port`.
pub struct ProcessUnit {
    service_path: PathBuf,
    port: u16,
    client: reqwest::Client,
    startup_timeout: Duration,
    ready: AtomicBool,
    body_limit: usize,
    in_flight: AtomicUsize,
    drained: Notify,
    /// Asks the supervisor to stop the child once `in_flight` reaches zero.
    retire: CancellationToken,
    /// Fired by the supervisor once the child is gone.
    terminated: CancellationToken,
    termination: Mutex<Option<ExecError>>,
}

impl ProcessUnit {
    fn new(
        service_path: PathBuf,
        port: u16,
        client: reqwest::Client,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            service_path,
            port,
            client,
            startup_timeout,
            ready: AtomicBool::new(false),
            body_limit: MAX_REQUEST_BODY_BYTES,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            retire: CancellationToken::new(),
            terminated: CancellationToken::new(),
            termination: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_alive(&self) -> bool {
        !self.terminated.is_cancelled()
    }

    fn retire(&self) {
        self.retire.cancel();
    }

    /// Resolves once the unit is retired and no request is in flight.
    async fn retired_and_idle(&self) {
        self.retire.cancelled().await;
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    fn enter(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(self)
    }

    fn terminate(&self, reason: ExecError) {
        *self
            .termination
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.terminated.cancel();
    }

    fn termination(&self) -> ExecError {
        self.termination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| ExecError::Terminated("worker exited".into()))
    }

    async fn wait_ready(&self) -> Result<(), ExecError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if TcpStream::connect((Ipv4Addr::LOCALHOST, self.port)).await.is_ok() {
                self.ready.store(true, Ordering::Release);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ExecError::NotReady(format!(
                    "{} not listening on port {} after {:?}",
                    self.service_path.display(),
                    self.port,
                    self.startup_timeout
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn proxy(&self, request: Request<Body>) -> Result<Response<Body>, ExecError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}:{}{}", Ipv4Addr::LOCALHOST, self.port, path_and_query);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let body = axum::body::to_bytes(body, self.body_limit)
            .await
            .map_err(|err| ExecError::Upstream(format!("reading request body: {err}")))?;

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| ExecError::Upstream(err.to_string()))?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(out) = response.headers_mut() {
            out.extend(upstream.headers().clone());
            strip_hop_by_hop(out);
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|err| ExecError::Upstream(err.to_string()))
    }
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    async fn forward(
        &self,
        request: Request<Body>,
        cancel: CancellationToken,
    ) -> Result<Response<Body>, ExecError> {
        let _in_flight = self.enter();
        let exchange = async {
            self.wait_ready().await?;
            self.proxy(request).await
        };
        tokio::select! {
            result = exchange => result,
            _ = self.terminated.cancelled() => Err(self.termination()),
            _ = cancel.cancelled() => Err(ExecError::Cancelled("request aborted".into())),
        }
    }
}

async fn supervise(mut child: Child, unit: Arc<ProcessUnit>, wall_clock: Duration) {
    let reason = tokio::select! {
        status = child.wait() => {
            let status = status.map(|s| s.to_string()).unwrap_or_else(|err| err.to_string());
            tracing::warn!(service = %unit.service_path.display(), %status, "worker exited");
            ExecError::Terminated(format!("worker exited ({status})"))
        }
        _ = tokio::time::sleep(wall_clock) => {
            let _ = child.kill().await;
            tracing::info!(service = %unit.service_path.display(), ?wall_clock, "worker reached wall clock limit");
            ExecError::Cancelled(format!("wall clock limit of {wall_clock:?} reached"))
        }
        _ = unit.retired_and_idle() => {
            let _ = child.kill().await;
            tracing::debug!(service = %unit.service_path.display(), "worker replaced");
            ExecError::Terminated("worker replaced by a newer instance".into())
        }
    };
    unit.terminate(reason);
}

/// Counts a request against its unit until dropped.
struct InFlight<'a>(&'a ProcessUnit);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

fn free_port() -> Result<u16, ExecError> {
    let listener = StdTcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .map_err(|err| ExecError::Spawn(format!("no free port: {err}")))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|err| ExecError::Spawn(format!("no free port: {err}")))
}

static HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}
