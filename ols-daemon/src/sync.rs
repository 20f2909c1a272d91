//! Mirror synchronization state machine.
//!
//! ```text
//!            request_update()                  attempt ends (ok or error)
//!   Ready ─────────────────────▶ Updating ─────────────────────────────▶ Ready
//!          (cache cleared here)      │
//!                                    └─ further request_update() calls join
//!                                       the in-flight attempt
//! ```
//!
//! The state lives in a `watch` channel. Entering `Updating` and clearing the
//! cache happen inside one `send_if_modified` call, before any network I/O.
//!
//! Poll cycles are serialized by a separate lock. A cycle that had to wait for
//! another one to finish returns that cycle's outcome instead of fetching again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use ols_core::{CommitId, MirrorStatus};
use ols_mirror::{MirrorRefs, VersionMirror};

use crate::cache::CacheRegistry;

/// Sequence number of an update attempt, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AttemptId(pub u64);

/// How an update attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Updated { commit: Option<CommitId> },
    Failed { error: String },
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Local and remote tips are identical; nothing was started.
    UpToDate { commit: CommitId },
    /// An update attempt ran (or was joined).
    Updated {
        attempt: AttemptId,
        outcome: Option<AttemptOutcome>,
    },
    /// Fetch or ref resolution failed; retried next cycle.
    FetchFailed { error: String },
}

/// Snapshot for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub status: MirrorStatus,
    pub attempts_started: u64,
    pub attempts_finished: u64,
    pub last_outcome: Option<AttemptOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncState {
    status: MirrorStatus,
    started: u64,
    finished: u64,
}

/// Serializes mirror updates and owns the cache invalidation trigger.
pub struct SyncCoordinator {
    mirror: Arc<VersionMirror>,
    cache: Arc<CacheRegistry>,
    state: watch::Sender<SyncState>,
    last_outcome: Mutex<Option<AttemptOutcome>>,
    check_lock: tokio::sync::Mutex<()>,
    checks_finished: AtomicU64,
    last_check: Mutex<Option<CheckOutcome>>,
}

impl SyncCoordinator {
    /// Construct in the `Ready` state. Call only once the mirror exists.
    pub fn new(mirror: Arc<VersionMirror>, cache: Arc<CacheRegistry>) -> Arc<Self> {
        let (state, _) = watch::channel(SyncState {
            status: MirrorStatus::Ready,
            started: 0,
            finished: 0,
        });
        Arc::new(Self {
            mirror,
            cache,
            state,
            last_outcome: Mutex::new(None),
            check_lock: tokio::sync::Mutex::new(()),
            checks_finished: AtomicU64::new(0),
            last_check: Mutex::new(None),
        })
    }

    pub fn status(&self) -> MirrorStatus {
        self.state.borrow().status
    }

    pub fn mirror(&self) -> &VersionMirror {
        &self.mirror
    }

    pub fn last_outcome(&self) -> Option<AttemptOutcome> {
        self.last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> SyncStats {
        let state = *self.state.borrow();
        SyncStats {
            status: state.status,
            attempts_started: state.started,
            attempts_finished: state.finished,
            last_outcome: self.last_outcome(),
        }
    }

    /// Start an update attempt, or join the one already in flight.
    ///
    /// Returns once that attempt has finished. Failures are logged, never
    /// returned: the state always goes back to `Ready`.
    pub async fn request_update(self: &Arc<Self>) -> AttemptId {
        let mut begun = None;
        let mut in_flight = 0;
        self.state.send_if_modified(|state| {
            if state.status == MirrorStatus::Updating {
                in_flight = state.started;
                return false;
            }
            state.started += 1;
            state.status = MirrorStatus::Updating;
            self.cache.clear();
            begun = Some(state.started);
            true
        });

        let target = match begun {
            Some(id) => {
                tracing::info!(attempt = id, "mirror update started");
                // Spawned so that a caller going away cannot leave the
                // state stuck in `Updating`.
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_attempt(id).await });
                id
            }
            None => {
                tracing::debug!(attempt = in_flight, "joining in-flight mirror update");
                in_flight
            }
        };

        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.finished >= target).await;
        AttemptId(target)
    }

    /// Suspend until the mirror is `Ready`. No timeout.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| state.status == MirrorStatus::Ready)
            .await;
    }

    /// One poll cycle: fetch, compare tips, update only if they differ.
    ///
    /// Overlapping calls collapse: a caller that finds a cycle in progress
    /// waits for it and returns its outcome.
    pub async fn check_and_update(self: &Arc<Self>) -> CheckOutcome {
        let seen = self.checks_finished.load(Ordering::Acquire);
        let _guard = self.check_lock.lock().await;
        if self.checks_finished.load(Ordering::Acquire) != seen {
            let joined = self
                .last_check
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(outcome) = joined {
                tracing::debug!("joined in-flight poll cycle");
                return outcome;
            }
        }

        let outcome = self.run_check().await;
        *self
            .last_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
        self.checks_finished.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn run_check(self: &Arc<Self>) -> CheckOutcome {
        self.wait_until_ready().await;

        let mirror = Arc::clone(&self.mirror);
        let refs = tokio::task::spawn_blocking(move || -> Result<MirrorRefs, String> {
            mirror.fetch_remote().map_err(|err| err.to_string())?;
            mirror.resolve_refs().map_err(|err| err.to_string())
        })
        .await
        .unwrap_or_else(|err| Err(format!("fetch task join error: {err}")));

        let refs = match refs {
            Ok(refs) => refs,
            Err(error) => {
                tracing::warn!(error = %error, "failed to fetch; retrying next cycle");
                return CheckOutcome::FetchFailed { error };
            }
        };

        if !refs.needs_update() {
            tracing::debug!(commit = %refs.local.short(), "mirror up to date");
            return CheckOutcome::UpToDate { commit: refs.local };
        }

        tracing::info!(
            local = %refs.local.short(),
            remote = %refs.remote.short(),
            "mirror behind remote",
        );
        let attempt = self.request_update().await;
        CheckOutcome::Updated {
            attempt,
            outcome: self.last_outcome(),
        }
    }

    /// Commit currently checked out, if it can be resolved.
    pub async fn local_commit(&self) -> Option<CommitId> {
        let mirror = Arc::clone(&self.mirror);
        match tokio::task::spawn_blocking(move || mirror.local_commit()).await {
            Ok(Ok(commit)) => Some(commit),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "failed to resolve local commit");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "local commit task join error");
                None
            }
        }
    }

    async fn run_attempt(&self, id: u64) {
        let mirror = Arc::clone(&self.mirror);
        let result = tokio::task::spawn_blocking(move || {
            mirror.update()?;
            Ok::<_, ols_mirror::MirrorError>(mirror.local_commit().ok())
        })
        .await;

        let outcome = match result {
            Ok(Ok(commit)) => {
                tracing::info!(
                    attempt = id,
                    commit = commit.as_ref().map(CommitId::short).unwrap_or("unknown"),
                    "mirror updated",
                );
                AttemptOutcome::Updated { commit }
            }
            Ok(Err(err)) => {
                tracing::error!(
                    attempt = id,
                    error = %err,
                    retryable = err.is_retryable(),
                    "failed to pull",
                );
                AttemptOutcome::Failed {
                    error: err.to_string(),
                }
            }
            Err(err) => {
                tracing::error!(attempt = id, error = %err, "update task join error");
                AttemptOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };

        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.state.send_modify(|state| {
            state.status = MirrorStatus::Ready;
            state.finished = id;
        });
    }
}
