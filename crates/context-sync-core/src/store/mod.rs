//! Storage abstraction for persisted index state.
//!
//! [`IndexStoreReader`] covers the read path used by search clients;
//! [`IndexStore`] adds the write surface used by the indexer. Backends in
//! the `context-sync` crate (filesystem, S3, composite, layered) and the
//! [`memory::MemoryStore`] here all honour the same contract:
//!
//! | Method | Contract |
//! |--------|----------|
//! | [`load_state`](IndexStoreReader::load_state) | Full state or `None` when the key is absent |
//! | [`load_search`](IndexStoreReader::load_search) | Search-only state or `None` |
//! | [`list`](IndexStoreReader::list) | Keys that have a full state |
//! | [`save`](IndexStore::save) | Replace both artifacts for a key |
//! | [`delete`](IndexStore::delete) | Remove both artifacts for a key |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::SyncError;
use crate::models::{IndexState, IndexStateSearchOnly, MANIFEST_FIELD};

/// File (or object) name of the full state within a key directory.
pub const STATE_FILE: &str = "state.json";
/// File (or object) name of the search-only state within a key directory.
pub const SEARCH_FILE: &str = "search.json";
/// Key addressing a store's root directory itself (used by `path:` specs).
pub const ROOT_KEY: &str = ".";

#[async_trait]
pub trait IndexStoreReader: Send + Sync {
    /// Load the full state (with manifest) for `key`.
    async fn load_state(&self, key: &str) -> Result<Option<IndexState>>;

    /// Load the search-only state for `key`.
    async fn load_search(&self, key: &str) -> Result<Option<IndexStateSearchOnly>>;

    /// List all keys with a valid full state.
    async fn list(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait IndexStore: IndexStoreReader {
    /// Persist both artifacts for `key`, superseding any previous pair.
    async fn save(
        &self,
        key: &str,
        full: &IndexState,
        search: &IndexStateSearchOnly,
    ) -> Result<()>;

    /// Remove both artifacts for `key`.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Make a key safe to use as a single path segment or object prefix.
///
/// Characters outside `[A-Za-z0-9._-]` become `_` and runs of `_` collapse.
/// Leading `.` and `_` and trailing `_` are trimmed, so a sanitized key is
/// never a hidden entry (backends reserve those for staging). [`ROOT_KEY`]
/// is kept as is; an all-dot key sanitizes to the empty string.
pub fn sanitize_key(key: &str) -> String {
    if key == ROOT_KEY {
        return ROOT_KEY.to_string();
    }

    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }

    out.trim_start_matches(|c: char| c == '.' || c == '_')
        .trim_end_matches('_')
        .to_string()
}

/// Reject full states that lack the engine manifest.
///
/// A full state without its manifest usually means a search-only file was
/// written (or read) in its place.
pub fn ensure_manifest(key: &str, state: &IndexState) -> Result<()> {
    if state.has_manifest() {
        Ok(())
    } else {
        Err(SyncError::CorruptState {
            key: key.to_string(),
            message: format!(
                "full state is missing the '{}' manifest (was a search-only state loaded?)",
                MANIFEST_FIELD
            ),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_key("acme/widgets"), "acme_widgets");
        assert_eq!(sanitize_key("a//b  c"), "a_b_c");
        assert_eq!(sanitize_key("/leading/trailing/"), "leading_trailing");
        assert_eq!(sanitize_key("docs-v1.2"), "docs-v1.2");
    }

    #[test]
    fn sanitize_root_and_dots() {
        assert_eq!(sanitize_key("."), ".");
        assert_eq!(sanitize_key(".."), "");
        assert_eq!(sanitize_key("/../"), "");
        assert_eq!(sanitize_key("///"), "");
        assert_eq!(sanitize_key("../etc"), "etc");
    }

    #[test]
    fn sanitize_never_yields_hidden_names() {
        assert_eq!(sanitize_key(".github"), "github");
        assert_eq!(sanitize_key("._.config"), "config");
        assert_eq!(sanitize_key("/.staging-x"), "staging-x");
        assert_eq!(sanitize_key("v1.2."), "v1.2.");
    }
}
