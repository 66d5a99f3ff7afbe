//! Layered stores: a local primary consulted before a read-only secondary.
//!
//! [`LayeredStore`] writes to the primary only and will not delete a key
//! that lives solely in the secondary. [`ReadOnlyLayeredStore`] has the
//! same read behaviour and no write surface at all.

use anyhow::{bail, Result};
use async_trait::async_trait;
use context_sync_core::models::{IndexState, IndexStateSearchOnly};
use context_sync_core::store::{sanitize_key, IndexStore, IndexStoreReader};
use context_sync_core::SyncError;
use std::collections::BTreeSet;
use std::sync::Arc;

async fn load_state_layered(
    primary: &dyn IndexStoreReader,
    secondary: &dyn IndexStoreReader,
    key: &str,
) -> Result<Option<IndexState>> {
    match primary.load_state(key).await? {
        Some(state) => Ok(Some(state)),
        None => secondary.load_state(key).await,
    }
}

async fn load_search_layered(
    primary: &dyn IndexStoreReader,
    secondary: &dyn IndexStoreReader,
    key: &str,
) -> Result<Option<IndexStateSearchOnly>> {
    match primary.load_search(key).await? {
        Some(state) => Ok(Some(state)),
        None => secondary.load_search(key).await,
    }
}

async fn list_layered(
    primary: &dyn IndexStoreReader,
    secondary: &dyn IndexStoreReader,
) -> Result<Vec<String>> {
    let mut keys: BTreeSet<String> = primary.list().await?.into_iter().collect();
    keys.extend(secondary.list().await?);
    Ok(keys.into_iter().collect())
}

fn listed(keys: &[String], key: &str) -> bool {
    let sanitized = sanitize_key(key);
    keys.iter().any(|k| k == key || *k == sanitized)
}

/// Writable primary over a read-only secondary.
pub struct LayeredStore {
    primary: Arc<dyn IndexStore>,
    secondary: Arc<dyn IndexStoreReader>,
}

impl LayeredStore {
    pub fn new(primary: Arc<dyn IndexStore>, secondary: Arc<dyn IndexStoreReader>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl IndexStoreReader for LayeredStore {
    async fn load_state(&self, key: &str) -> Result<Option<IndexState>> {
        load_state_layered(self.primary.as_ref(), self.secondary.as_ref(), key).await
    }

    async fn load_search(&self, key: &str) -> Result<Option<IndexStateSearchOnly>> {
        load_search_layered(self.primary.as_ref(), self.secondary.as_ref(), key).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        list_layered(self.primary.as_ref(), self.secondary.as_ref()).await
    }
}

#[async_trait]
impl IndexStore for LayeredStore {
    async fn save(
        &self,
        key: &str,
        full: &IndexState,
        search: &IndexStateSearchOnly,
    ) -> Result<()> {
        self.primary.save(key, full, search).await
    }

    /// Delete from the primary. Fails with
    /// [`SyncError::RemoteDeleteForbidden`] if the key exists only in the
    /// secondary.
    async fn delete(&self, key: &str) -> Result<()> {
        let in_primary = listed(&self.primary.list().await?, key);
        if !in_primary && listed(&self.secondary.list().await?, key) {
            bail!(SyncError::RemoteDeleteForbidden(key.to_string()));
        }
        self.primary.delete(key).await
    }
}

/// Read-merge of two stores with no write surface.
pub struct ReadOnlyLayeredStore {
    primary: Arc<dyn IndexStoreReader>,
    secondary: Arc<dyn IndexStoreReader>,
}

impl ReadOnlyLayeredStore {
    pub fn new(primary: Arc<dyn IndexStoreReader>, secondary: Arc<dyn IndexStoreReader>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl IndexStoreReader for ReadOnlyLayeredStore {
    async fn load_state(&self, key: &str) -> Result<Option<IndexState>> {
        load_state_layered(self.primary.as_ref(), self.secondary.as_ref(), key).await
    }

    async fn load_search(&self, key: &str) -> Result<Option<IndexStateSearchOnly>> {
        load_search_layered(self.primary.as_ref(), self.secondary.as_ref(), key).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        list_layered(self.primary.as_ref(), self.secondary.as_ref()).await
    }
}
