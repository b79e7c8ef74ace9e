//! Pre-rendered markup keyed by component source and property fingerprint.
//!
//! Two kinds of keys live in the store: `source|hash` holds the markup, and
//! `source` holds the JSON list of hashes in insertion order, oldest first.

use std::sync::Arc;

use crate::storage::{KeyValueStore, StorageError};

#[derive(Clone)]
pub struct PrerenderCache {
    store: Arc<dyn KeyValueStore>,
}

impl PrerenderCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn cache_key(source: &str, hash: &str) -> String {
        format!("{source}|{hash}")
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.store.get(key)
    }

    pub fn lookup(&self, source: &str, hash: &str) -> Result<Option<String>, StorageError> {
        self.store.get(&Self::cache_key(source, hash))
    }

    /// Fingerprints currently cached for `source`, oldest first.
    pub fn entries(&self, source: &str) -> Result<Vec<String>, StorageError> {
        match self.store.get(source)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Store `markup` and evict the oldest fingerprints so that at most
    /// `capacity` remain. A zero capacity stores nothing.
    pub fn store(
        &self,
        source: &str,
        hash: &str,
        markup: &str,
        capacity: usize,
    ) -> Result<(), StorageError> {
        if capacity == 0 {
            return Ok(());
        }

        self.store.set(&Self::cache_key(source, hash), markup)?;

        let mut entries = self.entries(source)?;
        entries.retain(|entry| entry != hash);
        while entries.len() >= capacity {
            let oldest = entries.remove(0);
            tracing::debug!(target: "storage", %source, hash = %oldest, "evicting pre-rendered entry");
            self.store.remove(&Self::cache_key(source, &oldest))?;
        }
        entries.push(hash.to_string());

        self.store.set(source, &serde_json::to_string(&entries)?)
    }
}
