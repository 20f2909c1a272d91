//! Domain types shared by the mirror, the sync coordinator and the dispatcher.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File every service directory must provide as its entry point.
pub const ENTRY_POINT_FILE: &str = "index.ts";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Name of a service: the first path segment of a request routed to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName(pub String);

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ServiceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServiceName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A commit id as printed by the version-control transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(pub String);

impl CommitId {
    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CommitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether the mirrored tree may currently be routed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MirrorStatus {
    #[default]
    Ready,
    Updating,
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorStatus::Ready => write!(f, "ready"),
            MirrorStatus::Updating => write!(f, "updating"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-service configuration resolved once and reused until the next
/// update attempt wipes the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub service_name: ServiceName,
    /// Import map handed to the execution unit, if the service has one.
    pub config_path: Option<PathBuf>,
}

/// Where a service lives on disk. Recomputed for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: ServiceName,
    pub directory_path: PathBuf,
    pub entry_point_path: PathBuf,
}

/// Ceilings every execution unit is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub memory_limit_mb: u64,
    pub wall_clock_timeout: Duration,
    pub cpu_time_soft_limit: Duration,
    pub cpu_time_hard_limit: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 150,
            wall_clock_timeout: Duration::from_secs(5 * 60),
            cpu_time_soft_limit: Duration::from_millis(10_000),
            cpu_time_hard_limit: Duration::from_millis(20_000),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(ServiceName::from("hello").to_string(), "hello");
        assert_eq!(CommitId::from("abc123").to_string(), "abc123");
    }

    #[test]
    fn commit_short_truncates_long_ids_only() {
        let id = CommitId::from("0123456789abcdef0123456789abcdef01234567");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(CommitId::from("abc").short(), "abc");
    }

    #[test]
    fn mirror_status_serializes_lowercase() {
        let json = serde_json::to_string(&MirrorStatus::Updating).expect("serialize");
        assert_eq!(json, "\"updating\"");
        assert_eq!(MirrorStatus::default(), MirrorStatus::Ready);
    }

    #[test]
    fn default_limits_match_unit_ceilings() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_limit_mb, 150);
        assert_eq!(limits.wall_clock_timeout, Duration::from_secs(300));
        assert!(limits.cpu_time_soft_limit < limits.cpu_time_hard_limit);
    }
}
