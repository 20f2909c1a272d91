//! Error types for ols-core.

use thiserror::Error;

/// Startup misconfiguration. Every variant is fatal: the process never
/// reaches a serving state with an invalid [`crate::Config`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Production mode without a remote to mirror.
    #[error(
        "worker repository is not provided! set OLS_REPO env variable, \
         e.g. OLS_REPO=https://github.com/zlumer/ols.git"
    )]
    MissingRepository,

    /// `OLS_REPO` and `OLS_DEV_MODE` were both set.
    #[error(
        "using both OLS_REPO and OLS_DEV_MODE is not supported; \
         use OLS_DEV_MODE for local development and OLS_REPO for production"
    )]
    ConflictingModes,

    /// A numeric variable did not parse (or was zero where zero is meaningless).
    #[error("invalid value for {var}: {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    /// `OLS_LISTEN` is not a socket address.
    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),

    /// `OLS_RUNNER` was set but contained no command.
    #[error("OLS_RUNNER must name a command")]
    EmptyRunner,
}
