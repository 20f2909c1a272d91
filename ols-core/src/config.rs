//! Environment-driven process configuration.
//!
//! Every knob is an `OLS_*` variable. [`Config::from_vars`] takes any set of
//! key/value pairs so tests never touch the real process environment.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::ResourceLimits;

pub const DEFAULT_BRANCH: &str = "master";
pub const DEFAULT_WORKERS_ROOT: &str = "/";
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 65;
pub const DEFAULT_MIRROR_DIR: &str = "/app/repo/green";
pub const DEFAULT_DEV_DIR: &str = "/app/workdir";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:9000";
pub const DEFAULT_RUNNER: &str = "deno run --allow-all";
pub const DEFAULT_AUTHOR_NAME: &str = "ols";
pub const AUTHOR_EMAIL: &str = "ols@example.org";

/// Name of the variable holding the API key; never forwarded to services.
pub const API_KEY_VAR: &str = "OLS_API_KEY";

/// Where the served tree comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// A directly mounted directory; no mirroring and no caching.
    Development { dir: PathBuf },
    /// A mirror of `repository` kept at `mirror_dir`.
    Production {
        repository: String,
        mirror_dir: PathBuf,
    },
}

/// Resolved process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: Mode,
    pub branch: String,
    /// Subpath of the tree that holds the service directories.
    pub workers_root: String,
    pub instance_name: String,
    pub api_key: Option<String>,
    pub polling_interval: Duration,
    pub listen: SocketAddr,
    /// Program and leading arguments used to launch a service entry point.
    pub runner: Vec<String>,
    pub limits: ResourceLimits,
}

impl Config {
    /// Load from the real process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Load from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| vars.get(key).map(String::as_str).unwrap_or("");
        let or_default = |key: &str, default: &str| {
            let value = get(key);
            if value.is_empty() {
                default.to_string()
            } else {
                value.to_string()
            }
        };

        let dev_mode = !get("OLS_DEV_MODE").is_empty();
        let repository = get("OLS_REPO");
        let mode = match (dev_mode, repository.is_empty()) {
            (true, false) => return Err(ConfigError::ConflictingModes),
            (true, true) => Mode::Development {
                dir: PathBuf::from(or_default("OLS_DEV_DIR", DEFAULT_DEV_DIR)),
            },
            (false, true) => return Err(ConfigError::MissingRepository),
            (false, false) => Mode::Production {
                repository: repository.to_string(),
                mirror_dir: PathBuf::from(or_default("OLS_REPO_DIR", DEFAULT_MIRROR_DIR)),
            },
        };

        let polling_secs = parse_positive(
            "OLS_POLLING_INTERVAL",
            get("OLS_POLLING_INTERVAL"),
            DEFAULT_POLLING_INTERVAL_SECS,
        )?;

        let listen_raw = or_default("OLS_LISTEN", DEFAULT_LISTEN);
        let listen = listen_raw
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListenAddr(listen_raw.clone()))?;

        let runner: Vec<String> = or_default("OLS_RUNNER", DEFAULT_RUNNER)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if runner.is_empty() {
            return Err(ConfigError::EmptyRunner);
        }

        let defaults = ResourceLimits::default();
        let limits = ResourceLimits {
            memory_limit_mb: parse_positive(
                "OLS_MEMORY_LIMIT_MB",
                get("OLS_MEMORY_LIMIT_MB"),
                defaults.memory_limit_mb,
            )?,
            wall_clock_timeout: Duration::from_millis(parse_positive(
                "OLS_WORKER_TIMEOUT_MS",
                get("OLS_WORKER_TIMEOUT_MS"),
                millis(defaults.wall_clock_timeout),
            )?),
            cpu_time_soft_limit: Duration::from_millis(parse_positive(
                "OLS_CPU_SOFT_LIMIT_MS",
                get("OLS_CPU_SOFT_LIMIT_MS"),
                millis(defaults.cpu_time_soft_limit),
            )?),
            cpu_time_hard_limit: Duration::from_millis(parse_positive(
                "OLS_CPU_HARD_LIMIT_MS",
                get("OLS_CPU_HARD_LIMIT_MS"),
                millis(defaults.cpu_time_hard_limit),
            )?),
        };

        let api_key = Some(get(API_KEY_VAR).to_string()).filter(|key| !key.is_empty());

        Ok(Self {
            mode,
            branch: or_default("OLS_BRANCH_NAME", DEFAULT_BRANCH),
            workers_root: or_default("OLS_WORKERS_ROOT", DEFAULT_WORKERS_ROOT),
            instance_name: get("OLS_INSTANCE_NAME").to_string(),
            api_key,
            polling_interval: Duration::from_secs(polling_secs),
            listen,
            runner,
            limits,
        })
    }

    pub fn is_dev(&self) -> bool {
        matches!(self.mode, Mode::Development { .. })
    }

    /// Root of the served tree: the dev mount or the mirror checkout.
    pub fn tree_root(&self) -> &Path {
        match &self.mode {
            Mode::Development { dir } => dir,
            Mode::Production { mirror_dir, .. } => mirror_dir,
        }
    }

    /// Directory holding one subdirectory per service.
    pub fn workers_dir(&self) -> PathBuf {
        join_subpath(self.tree_root(), &self.workers_root)
    }

    /// Author name used for fast-forward pulls.
    pub fn author_name(&self) -> &str {
        if self.instance_name.is_empty() {
            DEFAULT_AUTHOR_NAME
        } else {
            &self.instance_name
        }
    }

    /// Whitelisted subset of the configuration reported by the status API.
    pub fn public_env(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("OLS_BRANCH_NAME", self.branch.clone()),
            ("OLS_WORKERS_ROOT", self.workers_root.clone()),
            ("OLS_INSTANCE_NAME", self.instance_name.clone()),
            (
                "OLS_POLLING_INTERVAL",
                self.polling_interval.as_secs().to_string(),
            ),
        ])
    }
}

/// Join `subpath` under `root`, treating a leading `/` as relative to `root`.
fn join_subpath(root: &Path, subpath: &str) -> PathBuf {
    subpath
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .fold(root.to_path_buf(), |acc, segment| acc.join(segment))
}

fn parse_positive(var: &'static str, raw: &str, default: u64) -> Result<u64, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(default);
    }
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidNumber {
            var,
            value: raw.to_string(),
        }),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_subpath_ignores_leading_slash_and_dots() {
        let root = Path::new("/app/repo/green");
        assert_eq!(join_subpath(root, "/"), PathBuf::from("/app/repo/green"));
        assert_eq!(
            join_subpath(root, "/functions/./edge/"),
            PathBuf::from("/app/repo/green/functions/edge")
        );
    }

    #[test]
    fn parse_positive_rejects_zero_and_garbage() {
        assert_eq!(parse_positive("X", "", 7), Ok(7));
        assert_eq!(parse_positive("X", " 12 ", 7), Ok(12));
        assert!(parse_positive("X", "0", 7).is_err());
        assert!(parse_positive("X", "ten", 7).is_err());
    }
}
