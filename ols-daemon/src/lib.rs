//! OLS daemon: mirror synchronization, request dispatch and the HTTP surface.

pub mod cache;
pub mod dispatch;
mod error;
pub mod exec;
pub mod http;
pub mod poll;
pub mod process;
pub mod resolver;
mod runtime;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cache::CacheRegistry;
pub use dispatch::Dispatcher;
pub use error::DaemonError;
pub use exec::{ExecError, ExecutionBackend, ExecutionUnit, UnitConfig};
pub use process::ProcessBackend;
pub use resolver::{ResolveError, ServiceResolver};
pub use runtime::{run, run_with_backend, start_blocking, LOG_FORMAT_VAR};
pub use sync::{AttemptId, AttemptOutcome, CheckOutcome, SyncCoordinator, SyncStats};
