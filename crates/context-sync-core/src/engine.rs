//! Context engine contract and the offline [`LocalEngine`].
//!
//! The engine is the component that turns file sets into a searchable,
//! checkpointed index. Context Sync treats its exported state as an opaque
//! JSON value, with one exception: full exports carry a
//! [`MANIFEST_FIELD`](crate::models::MANIFEST_FIELD) that maps blob names
//! to paths, which is what makes incremental updates possible.
//!
//! # Provider Selection
//!
//! Engines are created through an [`EngineFactory`], which owns whatever
//! credentials the engine needs. [`LocalEngineFactory`] needs none.
//!
//! # Export Format (`LocalEngine`)
//!
//! ```text
//! full:        { checkpointId, addedBlobs, deletedBlobs, blobs: [[blob, path], ...] }
//! search-only: { checkpointId, addedBlobs, deletedBlobs, paths: [path, ...] }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::FileEntry;

/// Which flavour of state [`ContextEngine::export`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Complete state including the blob manifest.
    Full,
    /// Checkpoint id plus blob deltas, enough to run queries.
    SearchOnly,
}

/// Outcome of [`ContextEngine::add_to_index`], by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexingResult {
    /// Content the engine had not seen before.
    pub newly_uploaded: Vec<String>,
    /// Content already present (content-addressed dedup).
    pub already_uploaded: Vec<String>,
}

#[async_trait]
pub trait ContextEngine: Send + Sync {
    /// Add or replace files in the index.
    async fn add_to_index(&mut self, files: &[FileEntry]) -> Result<IndexingResult>;

    /// Remove files from the index by path. Unknown paths are ignored.
    async fn remove_from_index(&mut self, paths: &[String]) -> Result<()>;

    /// Export the current state.
    fn export(&self, mode: ExportMode) -> Result<serde_json::Value>;

    /// Run a query and return formatted results.
    async fn search(&self, query: &str, max_output_length: Option<usize>) -> Result<String>;

    /// Run a query and answer a question about the results.
    async fn search_and_ask(&self, query: &str, question: &str) -> Result<String>;
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// A brand-new, empty engine.
    async fn create(&self) -> Result<Box<dyn ContextEngine>>;

    /// An engine restored from a previous [`ContextEngine::export`].
    async fn import(&self, state: &serde_json::Value) -> Result<Box<dyn ContextEngine>>;
}

// ═══════════════════════════════════════════════════════════════════════
// LocalEngine
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalExport {
    #[serde(default)]
    checkpoint_id: Option<String>,
    #[serde(default)]
    added_blobs: Vec<String>,
    #[serde(default)]
    deleted_blobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blobs: Option<Vec<(String, String)>>,
    /// Indexed paths without blob names; search-only exports carry these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    paths: Option<Vec<String>>,
}

/// Offline, content-addressed engine.
///
/// Blob names are the SHA-256 of a file's path and contents. Search matches
/// query terms against paths and, for files added in this process, their
/// contents. An engine imported from a search-only export knows paths but
/// not blobs, so it can search and nothing else. Question answering needs
/// a remote engine.
#[derive(Debug, Default)]
pub struct LocalEngine {
    checkpoint_id: Option<String>,
    /// path → blob name
    blobs: BTreeMap<String, String>,
    added: BTreeSet<String>,
    deleted: BTreeSet<String>,
    /// Text of files added since creation/import.
    contents: HashMap<String, String>,
    /// Paths recorded in a search-only import (no manifest).
    search_paths: BTreeSet<String>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_export(state: &serde_json::Value) -> Result<Self> {
        let export: LocalExport = serde_json::from_value(state.clone())
            .context("context state is not a local engine export")?;

        let mut engine = Self {
            checkpoint_id: export.checkpoint_id,
            ..Self::default()
        };
        match export.blobs {
            Some(blobs) => {
                for (blob, path) in blobs {
                    engine.blobs.insert(path, blob);
                }
            }
            None => engine.search_paths = export.paths.unwrap_or_default().into_iter().collect(),
        }
        Ok(engine)
    }

    /// Number of files currently indexed.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn checkpoint(&self) -> String {
        let mut hasher = Sha256::new();
        for blob in self.blobs.values() {
            hasher.update(blob.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Content address for a file.
pub fn blob_name(path: &str, contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(contents.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl ContextEngine for LocalEngine {
    async fn add_to_index(&mut self, files: &[FileEntry]) -> Result<IndexingResult> {
        let mut result = IndexingResult::default();
        for file in files {
            let blob = blob_name(&file.path, &file.contents);
            match self.blobs.get(&file.path) {
                Some(existing) if *existing == blob => {
                    result.already_uploaded.push(file.path.clone());
                }
                previous => {
                    if let Some(old) = previous {
                        let old = old.clone();
                        if !self.added.remove(&old) {
                            self.deleted.insert(old);
                        }
                    }
                    self.added.insert(blob.clone());
                    self.blobs.insert(file.path.clone(), blob);
                    result.newly_uploaded.push(file.path.clone());
                }
            }
            self.contents
                .insert(file.path.clone(), file.contents.clone());
        }
        Ok(result)
    }

    async fn remove_from_index(&mut self, paths: &[String]) -> Result<()> {
        for path in paths {
            if let Some(blob) = self.blobs.remove(path) {
                if !self.added.remove(&blob) {
                    self.deleted.insert(blob);
                }
            }
            self.contents.remove(path);
        }
        Ok(())
    }

    fn export(&self, mode: ExportMode) -> Result<serde_json::Value> {
        let export = LocalExport {
            checkpoint_id: Some(self.checkpoint()),
            added_blobs: self.added.iter().cloned().collect(),
            deleted_blobs: self.deleted.iter().cloned().collect(),
            blobs: match mode {
                ExportMode::Full => Some(
                    self.blobs
                        .iter()
                        .map(|(path, blob)| (blob.clone(), path.clone()))
                        .collect(),
                ),
                ExportMode::SearchOnly => None,
            },
            paths: match mode {
                ExportMode::Full => None,
                ExportMode::SearchOnly => Some(self.blobs.keys().cloned().collect()),
            },
        };
        Ok(serde_json::to_value(export)?)
    }

    async fn search(&self, query: &str, max_output_length: Option<usize>) -> Result<String> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            bail!("query must not be empty");
        }

        let mut hits: Vec<(usize, &str)> = self
            .blobs
            .keys()
            .chain(self.search_paths.iter())
            .filter_map(|path| {
                let path_lower = path.to_lowercase();
                let body = self.contents.get(path).map(|c| c.to_lowercase());
                let score = terms
                    .iter()
                    .filter(|t| {
                        path_lower.contains(t.as_str())
                            || body.as_deref().is_some_and(|b| b.contains(t.as_str()))
                    })
                    .count();
                (score > 0).then_some((score, path.as_str()))
            })
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        if hits.is_empty() {
            return Ok("No results.".to_string());
        }

        let mut out = String::new();
        for (_, path) in hits {
            let mut block = format!("Path: {}\n", path);
            if let Some(body) = self.contents.get(path) {
                for line in body
                    .lines()
                    .filter(|l| {
                        let l = l.to_lowercase();
                        terms.iter().any(|t| l.contains(t.as_str()))
                    })
                    .take(3)
                {
                    block.push_str("    ");
                    block.push_str(line.trim());
                    block.push('\n');
                }
            }
            if let Some(max) = max_output_length {
                if out.len() + block.len() > max {
                    break;
                }
            }
            out.push_str(&block);
        }
        Ok(out)
    }

    async fn search_and_ask(&self, _query: &str, _question: &str) -> Result<String> {
        bail!("the local context engine cannot answer questions; configure a remote engine")
    }
}

/// Factory for [`LocalEngine`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEngineFactory;

#[async_trait]
impl EngineFactory for LocalEngineFactory {
    async fn create(&self) -> Result<Box<dyn ContextEngine>> {
        Ok(Box::new(LocalEngine::new()))
    }

    async fn import(&self, state: &serde_json::Value) -> Result<Box<dyn ContextEngine>> {
        Ok(Box::new(LocalEngine::from_export(state)?))
    }
}
