//! Request path → service directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;

use ols_core::{ServiceDescriptor, ServiceName, ENTRY_POINT_FILE};

/// Dedicated import map, preferred when present.
pub const IMPORT_MAP_FILE: &str = "import_map.json";
/// General runtime config; used as the map only if it declares `imports`.
pub const RUNTIME_CONFIG_FILE: &str = "deno.json";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("missing function name in request")]
    MissingServiceName,

    #[error("service {name} not found")]
    ServiceNotFound { name: ServiceName },
}

/// Maps request paths onto directories under the workers root.
#[derive(Debug, Clone)]
pub struct ServiceResolver {
    workers_root: PathBuf,
}

impl ServiceResolver {
    pub fn new(workers_root: impl Into<PathBuf>) -> Self {
        Self {
            workers_root: workers_root.into(),
        }
    }

    pub fn workers_root(&self) -> &Path {
        &self.workers_root
    }

    /// The first non-empty segment of `request_path` names the service.
    pub async fn resolve(&self, request_path: &str) -> Result<ServiceDescriptor, ResolveError> {
        let path = request_path.split(['?', '#']).next().unwrap_or_default();
        let name = path
            .split('/')
            .find(|segment| !segment.is_empty())
            .ok_or(ResolveError::MissingServiceName)?;
        let name = ServiceName::from(name);

        if !is_plain_segment(&name.0) {
            return Err(ResolveError::ServiceNotFound { name });
        }

        let directory_path = self.workers_root.join(&name.0);
        let is_dir = tokio::fs::metadata(&directory_path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(ResolveError::ServiceNotFound { name });
        }

        Ok(ServiceDescriptor {
            entry_point_path: directory_path.join(ENTRY_POINT_FILE),
            directory_path,
            name,
        })
    }

    /// Locate the optional import map for a service directory.
    pub async fn locate_import_map(&self, service_dir: &Path) -> Option<PathBuf> {
        let import_map = service_dir.join(IMPORT_MAP_FILE);
        if tokio::fs::try_exists(&import_map).await.unwrap_or(false) {
            return Some(import_map);
        }

        let runtime_config = service_dir.join(RUNTIME_CONFIG_FILE);
        let raw = match tokio::fs::read(&runtime_config).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %runtime_config.display(), error = %err, "cannot read runtime config");
                return None;
            }
        };
        match serde_json::from_slice::<serde_json::Value>(&raw) {
            Ok(json) if declares_imports(&json) => Some(runtime_config),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(path = %runtime_config.display(), error = %err, "invalid runtime config");
                None
            }
        }
    }
}

fn declares_imports(json: &serde_json::Value) -> bool {
    !matches!(
        json.get("imports"),
        None | Some(serde_json::Value::Null) | Some(serde_json::Value::Bool(false))
    )
}

/// Rejects names that would step outside the workers root.
fn is_plain_segment(name: &str) -> bool {
    name != "." && name != ".." && !name.contains('\\') && !name.contains('\0')
}
