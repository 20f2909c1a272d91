//! Per-service configuration cache.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use ols_core::{CacheEntry, ServiceName};

/// Service name → resolved configuration.
///
/// Entries are only ever removed all at once by [`CacheRegistry::clear`],
/// which the sync coordinator calls as an update attempt begins.
#[derive(Debug)]
pub struct CacheRegistry {
    enabled: bool,
    entries: RwLock<HashMap<ServiceName, CacheEntry>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            enabled: true,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A registry whose lookups always miss (development mode: files change
    /// on disk outside any sync cycle).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, name: &ServiceName) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn put(&self, name: ServiceName, entry: CacheEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, entry);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = entries.len();
        entries.clear();
        tracing::debug!(dropped, "service cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn entry(name: &str, map: Option<&str>) -> CacheEntry {
        CacheEntry {
            service_name: ServiceName::from(name),
            config_path: map.map(PathBuf::from),
        }
    }

    #[test]
    fn put_then_get_overwrites() {
        let cache = CacheRegistry::new();
        let name = ServiceName::from("hello");
        assert_eq!(cache.get(&name), None);

        cache.put(name.clone(), entry("hello", None));
        cache.put(name.clone(), entry("hello", Some("/srv/hello/import_map.json")));

        assert_eq!(
            cache.get(&name),
            Some(entry("hello", Some("/srv/hello/import_map.json")))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_drops_everything() {
        let cache = CacheRegistry::new();
        for name in ["a", "b", "c"] {
            cache.put(ServiceName::from(name), entry(name, None));
        }
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&ServiceName::from("a")), None);
    }

    #[test]
    fn disabled_registry_always_misses() {
        let cache = CacheRegistry::disabled();
        let name = ServiceName::from("hello");
        cache.put(name.clone(), entry("hello", None));
        assert_eq!(cache.get(&name), None);
        assert!(!cache.is_enabled());
    }
}
