//! Periodic upstream check.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::DaemonError;
use crate::sync::{AttemptOutcome, CheckOutcome, SyncCoordinator};

/// Runs [`SyncCoordinator::check_and_update`] every `interval`, measured from
/// the end of the previous cycle.
pub struct PollLoop {
    sync: Arc<SyncCoordinator>,
    interval: Duration,
}

impl PollLoop {
    pub fn new(sync: Arc<SyncCoordinator>, interval: Duration) -> Self {
        Self { sync, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        tracing::info!(interval_secs = self.interval.as_secs(), "polling upstream");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::debug!("poll loop stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.sync.check_and_update().await {
                CheckOutcome::UpToDate { .. } | CheckOutcome::FetchFailed { .. } => {}
                CheckOutcome::Updated { attempt, outcome } => match outcome {
                    Some(AttemptOutcome::Failed { error }) => {
                        tracing::warn!(attempt = attempt.0, %error, "poll-triggered update failed");
                    }
                    _ => tracing::info!(attempt = attempt.0, "poll-triggered update finished"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRegistry;
    use crate::testing::{fake_mirror, FakeGit};

    #[tokio::test]
    async fn polls_until_shutdown() {
        let git = FakeGit::in_sync("abc");
        let sync = SyncCoordinator::new(fake_mirror(&git), Arc::new(CacheRegistry::new()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(
            PollLoop::new(sync, Duration::from_millis(10)).run(shutdown_rx),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while git.fetches() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("at least two cycles");

        shutdown_tx.send(()).expect("send");
        handle.await.expect("join").expect("clean stop");
        assert_eq!(git.pulls(), 0, "refs equal, nothing pulled");
    }

    #[tokio::test]
    async fn shutdown_before_first_cycle_skips_polling() {
        let git = FakeGit::in_sync("abc");
        let sync = SyncCoordinator::new(fake_mirror(&git), Arc::new(CacheRegistry::new()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).expect("send");

        PollLoop::new(sync, Duration::from_secs(3600))
            .run(shutdown_rx)
            .await
            .expect("clean stop");
        assert_eq!(git.fetches(), 0);
    }

    #[tokio::test]
    async fn diverged_refs_are_pulled_by_the_loop() {
        let git = FakeGit::diverged("old", "new");
        let sync = SyncCoordinator::new(fake_mirror(&git), Arc::new(CacheRegistry::new()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(
            PollLoop::new(Arc::clone(&sync), Duration::from_millis(10)).run(shutdown_rx),
        );
        tokio::time::timeout(Duration::from_secs(5), async {
            while git.pulls() < 1 || sync.stats().attempts_finished < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("one update");

        shutdown_tx.send(()).expect("send");
        handle.await.expect("join").expect("clean stop");
        assert_eq!(git.pulls(), 1, "in sync after the first pull");
    }
}
