//! Index run orchestration.
//!
//! Coordinates one sync: source → filter → context engine → store. Each
//! run falls into one of these cases:
//!
//! | Prior state | `fetch_changes` | Run |
//! |-------------|-----------------|-----|
//! | none (or corrupt) | not called | full |
//! | present | `None` | full, with a fresh engine |
//! | present | empty | unchanged: no engine calls, nothing saved |
//! | present | non-empty | incremental: removals first, then additions |
//!
//! Full and incremental runs export both the full and the search-only
//! state and save them together.

use anyhow::Result;
use context_sync_core::engine::{ContextEngine, EngineFactory, ExportMode};
use context_sync_core::models::{
    FileChanges, FileEntry, IndexState, IndexStateSearchOnly, SourceMetadata, STATE_VERSION,
};
use context_sync_core::store::IndexStore;
use context_sync_core::SyncError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::source::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Full,
    Incremental,
    Unchanged,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Full => "full",
            IndexKind::Incremental => "incremental",
            IndexKind::Unchanged => "unchanged",
        }
    }
}

/// Outcome of [`Indexer::index`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResult {
    pub kind: IndexKind,
    /// Files sent to the engine (added + modified).
    pub files_indexed: usize,
    pub files_removed: usize,
    /// Files the engine had to upload.
    pub files_new_or_modified: usize,
    /// Files the engine already held (content-addressed dedup).
    pub files_unchanged: usize,
    pub duration_ms: u64,
    /// Paths newly added (all paths on a full run).
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl IndexResult {
    fn unchanged(started: Instant) -> Self {
        Self {
            kind: IndexKind::Unchanged,
            files_indexed: 0,
            files_removed: 0,
            files_new_or_modified: 0,
            files_unchanged: 0,
            duration_ms: elapsed_ms(started),
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn paths(files: &[FileEntry]) -> Vec<String> {
    files.iter().map(|f| f.path.clone()).collect()
}

pub struct Indexer {
    engines: Arc<dyn EngineFactory>,
}

impl Indexer {
    pub fn new(engines: Arc<dyn EngineFactory>) -> Self {
        Self { engines }
    }

    /// Bring the index stored under `key` up to date with `source`.
    pub async fn index(
        &self,
        source: &Source,
        store: &dyn IndexStore,
        key: &str,
    ) -> Result<IndexResult> {
        let started = Instant::now();

        let previous = match store.load_state(key).await {
            Ok(state) => state,
            Err(e) if matches!(e.downcast_ref::<SyncError>(), Some(SyncError::CorruptState { .. })) => {
                tracing::warn!(key, error = %e, "previous state unusable; rebuilding");
                None
            }
            Err(e) => return Err(e),
        };

        let Some(previous) = previous else {
            tracing::info!(key, "no previous index; running full index");
            return self.full(source, store, key, started).await;
        };

        match source.fetch_changes(&previous.source).await? {
            None => self.full(source, store, key, started).await,
            Some(changes) if changes.is_empty() => {
                tracing::info!(key, "source unchanged");
                Ok(IndexResult::unchanged(started))
            }
            Some(changes) => {
                self.incremental(source, store, key, &previous, changes, started)
                    .await
            }
        }
    }

    async fn full(
        &self,
        source: &Source,
        store: &dyn IndexStore,
        key: &str,
        started: Instant,
    ) -> Result<IndexResult> {
        let mut engine = self.engines.create().await?;
        let files = source.fetch_all().await?;
        let uploaded = engine.add_to_index(&files).await?;
        let metadata = source.get_metadata().await?;
        persist(engine.as_ref(), store, key, metadata).await?;

        let result = IndexResult {
            kind: IndexKind::Full,
            files_indexed: files.len(),
            files_removed: 0,
            files_new_or_modified: uploaded.newly_uploaded.len(),
            files_unchanged: uploaded.already_uploaded.len(),
            duration_ms: elapsed_ms(started),
            added: paths(&files),
            modified: Vec::new(),
            removed: Vec::new(),
        };
        tracing::info!(
            key,
            files = result.files_indexed,
            uploaded = result.files_new_or_modified,
            duration_ms = result.duration_ms,
            "full index complete"
        );
        Ok(result)
    }

    async fn incremental(
        &self,
        source: &Source,
        store: &dyn IndexStore,
        key: &str,
        previous: &IndexState,
        changes: FileChanges,
        started: Instant,
    ) -> Result<IndexResult> {
        let mut engine = self.engines.import(&previous.context_state).await?;

        if !changes.removed.is_empty() {
            engine.remove_from_index(&changes.removed).await?;
        }

        let mut files = changes.added.clone();
        files.extend(changes.modified.iter().cloned());
        let uploaded = if files.is_empty() {
            Default::default()
        } else {
            engine.add_to_index(&files).await?
        };

        let metadata = source.get_metadata().await?;
        persist(engine.as_ref(), store, key, metadata).await?;

        let result = IndexResult {
            kind: IndexKind::Incremental,
            files_indexed: files.len(),
            files_removed: changes.removed.len(),
            files_new_or_modified: uploaded.newly_uploaded.len(),
            files_unchanged: uploaded.already_uploaded.len(),
            duration_ms: elapsed_ms(started),
            added: paths(&changes.added),
            modified: paths(&changes.modified),
            removed: changes.removed,
        };
        tracing::info!(
            key,
            indexed = result.files_indexed,
            removed = result.files_removed,
            duration_ms = result.duration_ms,
            "incremental index complete"
        );
        Ok(result)
    }
}

async fn persist(
    engine: &dyn ContextEngine,
    store: &dyn IndexStore,
    key: &str,
    source: SourceMetadata,
) -> Result<()> {
    let full = IndexState {
        version: STATE_VERSION,
        context_state: engine.export(ExportMode::Full)?,
        source: source.clone(),
    };
    let search = IndexStateSearchOnly {
        version: STATE_VERSION,
        context_state: engine.export(ExportMode::SearchOnly)?,
        source,
    };
    store.save(key, &full, &search).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_camel_case() {
        let started = Instant::now();
        let json = serde_json::to_value(IndexResult::unchanged(started)).unwrap();
        assert_eq!(json["kind"], "unchanged");
        assert_eq!(json["filesIndexed"], 0);
        assert!(json.get("filesNewOrModified").is_some());
        assert!(json.get("durationMs").is_some());
    }

    #[test]
    fn kind_labels() {
        assert_eq!(IndexKind::Full.as_str(), "full");
        assert_eq!(IndexKind::Incremental.as_str(), "incremental");
    }
}
