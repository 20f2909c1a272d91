//! OLS core library: domain types, environment configuration, errors.
//!
//! - [`types`]: newtypes and the records shared by the mirror and the daemon
//! - [`config`]: env-driven [`Config`]
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, Mode};
pub use error::ConfigError;
pub use types::{
    CacheEntry, CommitId, MirrorStatus, ResourceLimits, ServiceDescriptor, ServiceName,
    ENTRY_POINT_FILE,
};
