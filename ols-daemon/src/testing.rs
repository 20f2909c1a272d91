//! Shared fakes for unit tests: an in-memory git transport and a recording
//! execution backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ols_core::CommitId;
use ols_mirror::{AuthorIdentity, GitTransport, MirrorError, VersionMirror};

use crate::exec::{ExecError, ExecutionBackend, ExecutionUnit, UnitConfig};

// ─── Git ───────────────────────────────────────────────────────────────────

/// Transport holding a local and a remote tip. A successful pull moves the
/// local tip to the remote one.
#[derive(Default)]
pub(crate) struct FakeGit {
    local: Mutex<String>,
    remote: Mutex<String>,
    fetches: AtomicUsize,
    pulls: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_pull: AtomicBool,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
    fetch_delay: Mutex<Duration>,
    active_fetches: AtomicUsize,
    peak_fetches: AtomicUsize,
}

impl FakeGit {
    pub(crate) fn in_sync(commit: &str) -> Arc<Self> {
        Self::diverged(commit, commit)
    }

    pub(crate) fn diverged(local: &str, remote: &str) -> Arc<Self> {
        let git = Self::default();
        *git.local.lock().expect("local") = local.to_string();
        *git.remote.lock().expect("remote") = remote.to_string();
        Arc::new(git)
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_fetches(&self) {
        self.fail_fetch.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_pulls(&self) {
        self.fail_pull.store(true, Ordering::SeqCst);
    }

    /// Make every fetch take `delay`.
    pub(crate) fn slow_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock().expect("delay") = delay;
    }

    /// Highest number of fetches observed running at once.
    pub(crate) fn peak_concurrent_fetches(&self) -> usize {
        self.peak_fetches.load(Ordering::SeqCst)
    }

    /// Make the next pull block until the returned sender fires.
    pub(crate) fn gate_pulls(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.gate.lock().expect("gate") = Some(rx);
        tx
    }
}

impl GitTransport for FakeGit {
    fn clone_branch(&self, _url: &str, dir: &Path, _branch: &str) -> Result<(), MirrorError> {
        std::fs::create_dir_all(dir.join(".git")).map_err(|source| MirrorError::Io {
            path: dir.to_path_buf(),
            source,
        })
    }

    fn fetch_branch(&self, _dir: &Path, _branch: &str) -> Result<(), MirrorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let active = self.active_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_fetches.fetch_max(active, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().expect("delay");
        std::thread::sleep(delay);
        self.active_fetches.fetch_sub(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(MirrorError::Network {
                operation: "fetch",
                details: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn pull_fast_forward(
        &self,
        _dir: &Path,
        branch: &str,
        _identity: &AuthorIdentity,
    ) -> Result<(), MirrorError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().expect("gate").take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(MirrorError::NonFastForward {
                branch: branch.to_string(),
                details: "Not possible to fast-forward".into(),
            });
        }
        let remote = self.remote.lock().expect("remote").clone();
        *self.local.lock().expect("local") = remote;
        Ok(())
    }

    fn resolve_ref(&self, _dir: &Path, reference: &str) -> Result<CommitId, MirrorError> {
        let value = if reference.starts_with("refs/remotes/") {
            self.remote.lock().expect("remote").clone()
        } else {
            self.local.lock().expect("local").clone()
        };
        Ok(CommitId(value))
    }
}

pub(crate) fn fake_mirror(git: &Arc<FakeGit>) -> Arc<VersionMirror> {
    Arc::new(VersionMirror::new(
        git.clone(),
        "https://example.org/services.git",
        "/nonexistent/mirror",
        "master",
        AuthorIdentity {
            name: "ols".into(),
            email: "ols@example.org".into(),
        },
    ))
}

// ─── Execution ─────────────────────────────────────────────────────────────

/// Backend that records every [`UnitConfig`] and hands out units answering
/// with a JSON echo of the request.
#[derive(Default)]
pub(crate) struct FakeBackend {
    configs: Mutex<Vec<UnitConfig>>,
    failure: Mutex<Option<ExecError>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn configs(&self) -> Vec<UnitConfig> {
        self.configs.lock().expect("configs").clone()
    }

    /// Make every forwarded request fail with `err`.
    pub(crate) fn fail_with(&self, err: ExecError) {
        *self.failure.lock().expect("failure") = Some(err);
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn create_or_reuse(
        &self,
        config: UnitConfig,
    ) -> Result<Arc<dyn ExecutionUnit>, ExecError> {
        self.configs.lock().expect("configs").push(config.clone());
        let unit: Arc<dyn ExecutionUnit> = Arc::new(EchoUnit {
            service_path: config.service_path,
            failure: self.failure.lock().expect("failure").clone(),
        });
        Ok(unit)
    }

    fn metrics(&self) -> serde_json::Value {
        json!({ "units_created": self.configs.lock().expect("configs").len() })
    }
}

struct EchoUnit {
    service_path: PathBuf,
    failure: Option<ExecError>,
}

#[async_trait]
impl ExecutionUnit for EchoUnit {
    async fn forward(
        &self,
        request: Request<Body>,
        _cancel: CancellationToken,
    ) -> Result<Response<Body>, ExecError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let body = json!({
            "service_path": self.service_path,
            "uri": request.uri().to_string(),
        });
        let response = Response::builder()
            .status(StatusCode::IM_A_TEAPOT)
            .header("x-echo", "1")
            .body(Body::from(body.to_string()))
            .map_err(|err| ExecError::Upstream(err.to_string()))?;
        Ok(response)
    }
}

pub(crate) fn service_tree(root: &Path, services: &[&str]) -> HashMap<String, PathBuf> {
    services
        .iter()
        .map(|name| {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).expect("service dir");
            std::fs::write(dir.join("index.ts"), "Deno.serve(() => new Response('ok'))\n")
                .expect("entry point");
            (name.to_string(), dir)
        })
        .collect()
}
