//! Per-invocation memoization of parsed instance and blueprint records.
//!
//! The cache is an optimization only. Writers must call [`RecordCache::clear`]
//! after changing the underlying file, and nothing here is shared across
//! processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

struct CacheEntry<T> {
    path: PathBuf,
    value: Arc<T>,
}

pub struct RecordCache<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
}

impl<T> RecordCache<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Remember `value` as the parsed contents of `path` for `name`.
    pub fn mark_cached(&self, name: &str, path: &Path, value: Arc<T>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            name.to_string(),
            CacheEntry {
                path: path.to_path_buf(),
                value,
            },
        );
    }

    pub fn is_cached(&self, name: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(name).map(|entry| Arc::clone(&entry.value))
    }

    /// Resolved record path for a cached name.
    pub fn path(&self, name: &str) -> Option<PathBuf> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(name).map(|entry| entry.path.clone())
    }

    pub fn clear(&self, name: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(name);
    }

    pub fn clear_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }
}

impl<T> Default for RecordCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
