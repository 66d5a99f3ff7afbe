//! Per-index query clients with lazy construction.
//!
//! [`IndexClientCache`] keeps a table of available indexes and builds an
//! [`IndexClient`] for one only when it is first asked for. It runs in one
//! of two modes:
//!
//! - **fixed**: an allowlist of names. The table only ever contains names
//!   from the allowlist, even after a refresh.
//! - **discovery**: every key the store lists.
//!
//! Indexes whose search state cannot be loaded are left out of the table
//! with a warning; one bad index never hides the others.

use anyhow::Result;
use chrono::{DateTime, Utc};
use context_sync_core::engine::{ContextEngine, EngineFactory};
use context_sync_core::models::{FileInfo, SourceKind, SourceMetadata};
use context_sync_core::store::IndexStoreReader;
use context_sync_core::SyncError;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::source::{Source, SourceOptions};

/// Summary of one index, taken from its stored source metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    pub source_type: SourceKind,
    pub identifier: String,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub configured_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ref: Option<String>,
    pub synced_at: DateTime<Utc>,
}

impl IndexInfo {
    fn from_metadata(name: &str, meta: &SourceMetadata) -> Self {
        Self {
            name: name.to_string(),
            source_type: meta.kind(),
            identifier: meta.identifier(),
            configured_ref: meta.configured_ref().map(str::to_string),
            resolved_ref: meta.resolved_ref().map(str::to_string),
            synced_at: meta.synced_at(),
        }
    }
}

/// Query handle for one index.
///
/// Search goes through a context engine imported from the search-only
/// state. File browsing goes to the original source, pinned to the
/// indexed commit; that connector is built on first use.
pub struct IndexClient {
    info: IndexInfo,
    engine: Box<dyn ContextEngine>,
    metadata: SourceMetadata,
    options: SourceOptions,
    source: OnceCell<Source>,
}

impl IndexClient {
    pub fn info(&self) -> &IndexInfo {
        &self.info
    }

    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    pub async fn search(&self, query: &str, max_output_length: Option<usize>) -> Result<String> {
        self.engine.search(query, max_output_length).await
    }

    pub async fn search_and_ask(&self, query: &str, question: &str) -> Result<String> {
        self.engine.search_and_ask(query, question).await
    }

    pub async fn list_files(&self, directory: &str) -> Result<Vec<FileInfo>> {
        self.source().await?.list_files(directory).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Option<String>> {
        self.source().await?.read_file(path).await
    }

    async fn source(&self) -> Result<&Source> {
        self.source
            .get_or_try_init(|| async { Source::from_metadata(&self.metadata, &self.options) })
            .await
    }
}

pub struct IndexClientCache {
    store: Arc<dyn IndexStoreReader>,
    engines: Arc<dyn EngineFactory>,
    options: SourceOptions,
    allowlist: Option<Vec<String>>,
    indexes: BTreeMap<String, IndexInfo>,
    clients: HashMap<String, Arc<IndexClient>>,
}

impl IndexClientCache {
    /// Build the cache and its initial index table.
    ///
    /// `allowlist = Some(..)` selects fixed mode; `None` discovers every
    /// index in `store`.
    pub async fn new(
        store: Arc<dyn IndexStoreReader>,
        engines: Arc<dyn EngineFactory>,
        options: SourceOptions,
        allowlist: Option<Vec<String>>,
    ) -> Result<Self> {
        let mut cache = Self {
            store,
            engines,
            options,
            allowlist,
            indexes: BTreeMap::new(),
            clients: HashMap::new(),
        };
        cache.refresh_index_list().await?;
        Ok(cache)
    }

    pub fn is_fixed(&self) -> bool {
        self.allowlist.is_some()
    }

    /// Known indexes, sorted by name.
    pub fn list(&self) -> Vec<IndexInfo> {
        self.indexes.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// Client for `name`, created and cached on first request.
    pub async fn get_client(&mut self, name: &str) -> Result<Arc<IndexClient>> {
        if let Some(client) = self.clients.get(name) {
            return Ok(Arc::clone(client));
        }

        let Some(info) = self.indexes.get(name).cloned() else {
            return Err(SyncError::not_found(format!(
                "index '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
            .into());
        };

        let state = self
            .store
            .load_search(name)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("index '{}'", name)))?;
        let engine = self.engines.import(&state.context_state).await?;

        tracing::debug!(index = name, "created index client");
        let client = Arc::new(IndexClient {
            info,
            engine,
            metadata: state.source,
            options: self.options.clone(),
            source: OnceCell::new(),
        });
        self.clients.insert(name.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Re-read the index table from the store.
    ///
    /// Clients for indexes that are still present stay cached.
    pub async fn refresh_index_list(&mut self) -> Result<()> {
        let candidates = match &self.allowlist {
            Some(names) => names.clone(),
            None => self.store.list().await?,
        };

        let mut indexes = BTreeMap::new();
        for name in candidates {
            match self.store.load_search(&name).await {
                Ok(Some(state)) => {
                    indexes.insert(name.clone(), IndexInfo::from_metadata(&name, &state.source));
                }
                Ok(None) => {
                    tracing::warn!(index = %name, "index not found in store; skipping");
                }
                Err(e) => {
                    tracing::warn!(index = %name, error = %e, "failed to load index; skipping");
                }
            }
        }

        self.clients.retain(|name, _| indexes.contains_key(name));
        tracing::debug!(count = indexes.len(), fixed = self.is_fixed(), "index list refreshed");
        self.indexes = indexes;
        Ok(())
    }

    /// Drop the cached client for `name` so the next request rebuilds it.
    pub fn invalidate_client(&mut self, name: &str) -> bool {
        self.clients.remove(name).is_some()
    }
}
