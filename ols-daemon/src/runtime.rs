use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use ols_core::{Config, ConfigError, Mode};
use ols_mirror::{GitCli, GitTransport, VersionMirror};

use crate::cache::CacheRegistry;
use crate::dispatch::{forwarded_environment, Dispatcher};
use crate::error::{io_err, DaemonError};
use crate::exec::ExecutionBackend;
use crate::http::{router, AppState};
use crate::poll::PollLoop;
use crate::process::ProcessBackend;
use crate::resolver::ServiceResolver;
use crate::sync::SyncCoordinator;

/// Selects JSON log lines when set to `json`.
pub const LOG_FORMAT_VAR: &str = "OLS_LOG_FORMAT";

pub fn start_blocking(config: Config) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Serve with the process-based execution backend.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    let backend = Arc::new(ProcessBackend::new(config.runner.clone()));
    run_with_backend(config, backend).await
}

pub async fn run_with_backend(
    config: Config,
    backend: Arc<dyn ExecutionBackend>,
) -> Result<(), DaemonError> {
    let config = Arc::new(config);

    let (sync, cache) = match &config.mode {
        Mode::Development { dir } => {
            check_dev_tree(dir, &config.workers_dir()).await?;
            (None, Arc::new(CacheRegistry::disabled()))
        }
        Mode::Production { .. } => {
            let cache = Arc::new(CacheRegistry::new());
            let sync = bootstrap_mirror(&config, Arc::clone(&cache)).await?;
            (Some(sync), cache)
        }
    };

    let dispatcher = Dispatcher::new(
        sync.clone(),
        Arc::clone(&cache),
        ServiceResolver::new(config.workers_dir()),
        backend,
        config.limits,
    )
    .with_environment(forwarded_environment());
    let state = AppState::new(Arc::clone(&config), Arc::new(dispatcher), sync.clone(), cache);

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| io_err(config.listen.to_string(), e))?;
    let mode = if config.is_dev() { "dev" } else { "production" };
    tracing::info!(
        addr = %config.listen,
        mode,
        workers = %config.workers_dir().display(),
        "listening",
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let poll_handle = {
        let shutdown = shutdown_tx.clone();
        let interval = config.polling_interval;
        tokio::spawn(async move {
            match sync {
                Some(sync) => PollLoop::new(sync, interval).run(shutdown.subscribe()).await,
                None => Ok(()),
            }
        })
    };

    let server_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let app = router(state);
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .map_err(|e| io_err("http-server", e));
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(io_err("ctrl-c handler", err)),
                    }
                }
            }
        })
    };

    let (poll_result, server_result, signal_result) =
        tokio::join!(poll_handle, server_handle, signal_handle);

    handle_join("poll_loop", poll_result)?;
    handle_join("http_server", server_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Clone or fetch the mirror, then bring it up to date once before serving.
async fn bootstrap_mirror(
    config: &Config,
    cache: Arc<CacheRegistry>,
) -> Result<Arc<SyncCoordinator>, DaemonError> {
    let transport: Arc<dyn GitTransport> = Arc::new(GitCli::default());
    let mirror = Arc::new(
        VersionMirror::from_config(config, transport).ok_or(ConfigError::MissingRepository)?,
    );

    let blocking = Arc::clone(&mirror);
    let outcome = tokio::task::spawn_blocking(move || blocking.ensure_mirrored())
        .await
        .map_err(|err| DaemonError::Join {
            task: "ensure_mirrored",
            details: err.to_string(),
        })??;
    tracing::info!(
        ?outcome,
        dir = %mirror.dir().display(),
        branch = mirror.branch(),
        "mirror ready",
    );

    let sync = SyncCoordinator::new(mirror, cache);
    sync.check_and_update().await;
    Ok(sync)
}

async fn check_dev_tree(dir: &Path, workers: &Path) -> Result<(), DaemonError> {
    let is_dir = tokio::fs::metadata(dir)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(DaemonError::DevDirMissing {
            path: dir.to_path_buf(),
        });
    }

    let empty = match tokio::fs::read_dir(workers).await {
        Ok(mut entries) => entries
            .next_entry()
            .await
            .map_err(|e| io_err(workers, e))?
            .is_none(),
        Err(_) => true,
    };
    if empty {
        tracing::warn!(workers = %workers.display(), "development tree has no services");
    }
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Join {
            task,
            details: err.to_string(),
        }),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match std::env::var(LOG_FORMAT_VAR).as_deref() {
        Ok("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };
}
