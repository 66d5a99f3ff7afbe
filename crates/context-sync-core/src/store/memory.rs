//! In-memory [`IndexStore`] implementation for testing and embedding.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Values are cloned on both
//! save and load, so callers can never mutate stored state through a
//! shared reference. Keys go through [`sanitize_key`] exactly as they do
//! for the disk and object backends.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::error::SyncError;
use crate::models::{IndexState, IndexStateSearchOnly};

use super::{ensure_manifest, sanitize_key, IndexStore, IndexStoreReader};

#[derive(Clone)]
struct StoredPair {
    full: IndexState,
    search: IndexStateSearchOnly,
}

/// In-memory store with the same external contract as the disk backends.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredPair>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("memory store lock poisoned")
}

fn stored_key(key: &str) -> Result<String> {
    let sanitized = sanitize_key(key);
    if sanitized.is_empty() {
        bail!(SyncError::config(format!(
            "index key '{}' is empty after sanitization",
            key
        )));
    }
    Ok(sanitized)
}

#[async_trait]
impl IndexStoreReader for MemoryStore {
    async fn load_state(&self, key: &str) -> Result<Option<IndexState>> {
        let stored = stored_key(key)?;
        let entries = self.entries.read().map_err(poisoned)?;
        match entries.get(&stored) {
            Some(pair) => {
                ensure_manifest(key, &pair.full)?;
                Ok(Some(pair.full.clone()))
            }
            None => Ok(None),
        }
    }

    async fn load_search(&self, key: &str) -> Result<Option<IndexStateSearchOnly>> {
        let stored = stored_key(key)?;
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(&stored).map(|pair| pair.search.clone()))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn save(
        &self,
        key: &str,
        full: &IndexState,
        search: &IndexStateSearchOnly,
    ) -> Result<()> {
        let stored = stored_key(key)?;
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(
            stored,
            StoredPair {
                full: full.clone(),
                search: search.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let stored = stored_key(key)?;
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(&stored);
        Ok(())
    }
}
