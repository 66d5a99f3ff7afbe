//! Filesystem-backed index store.
//!
//! Each key gets one directory under the store root holding the two state
//! artifacts:
//!
//! ```text
//! {root}/{sanitized key}/state.json    full state (with manifest)
//! {root}/{sanitized key}/search.json   search-only state
//! ```
//!
//! The key [`ROOT_KEY`] addresses the root directory itself; `path:` index
//! specs use it to point a store straight at an index directory.
//!
//! # Atomicity
//!
//! A save writes both files into a fresh `.staging-<uuid>` sibling, moves
//! the current key directory aside to `.trash-<uuid>`, renames the staging
//! directory into place, and finally removes the trash. Readers see either
//! the old pair or the new pair, never a mix. The root key cannot be
//! swapped as a directory, so its files are replaced one by one with
//! `search.json` first and `state.json` last.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use context_sync_core::models::{IndexState, IndexStateSearchOnly};
use context_sync_core::store::{
    ensure_manifest, sanitize_key, IndexStore, IndexStoreReader, ROOT_KEY, SEARCH_FILE,
    STATE_FILE,
};
use context_sync_core::SyncError;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// Index store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `key`, or an error if the key sanitizes to nothing.
    pub fn key_dir(&self, key: &str) -> Result<PathBuf> {
        let sanitized = sanitize_key(key);
        if sanitized.is_empty() {
            bail!(SyncError::config(format!(
                "index key '{}' is empty after sanitization",
                key
            )));
        }
        if sanitized == ROOT_KEY {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(sanitized))
    }

    async fn save_in_place(
        &self,
        dir: &Path,
        full: &IndexState,
        search: &IndexStateSearchOnly,
    ) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        replace_file(dir, SEARCH_FILE, &to_json(search)?).await?;
        replace_file(dir, STATE_FILE, &to_json(full)?).await?;
        Ok(())
    }

    async fn save_swapped(
        &self,
        dir: &Path,
        full: &IndexState,
        search: &IndexStateSearchOnly,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create store root {}", self.root.display()))?;

        let id = uuid::Uuid::new_v4();
        let staging = self.root.join(format!("{}{}", STAGING_PREFIX, id));
        let trash = self.root.join(format!("{}{}", TRASH_PREFIX, id));

        tokio::fs::create_dir(&staging)
            .await
            .with_context(|| format!("Failed to create {}", staging.display()))?;
        let written = async {
            tokio::fs::write(staging.join(SEARCH_FILE), to_json(search)?).await?;
            tokio::fs::write(staging.join(STATE_FILE), to_json(full)?).await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e.context(format!("Failed to stage index state in {}", staging.display())));
        }

        let had_previous = tokio::fs::try_exists(dir).await.unwrap_or(false);
        if had_previous {
            tokio::fs::rename(dir, &trash)
                .await
                .with_context(|| format!("Failed to move aside {}", dir.display()))?;
        }
        if let Err(e) = tokio::fs::rename(&staging, dir).await {
            if had_previous {
                let _ = tokio::fs::rename(&trash, dir).await;
            }
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to move staged state into {}", dir.display())));
        }
        if had_previous {
            if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
                tracing::warn!(path = %trash.display(), error = %e, "failed to remove old index state");
            }
        }
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

async fn replace_file(dir: &Path, name: &str, contents: &str) -> Result<()> {
    let tmp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, dir.join(name))
        .await
        .with_context(|| format!("Failed to replace {}", dir.join(name).display()))?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("Failed to read {}", path.display())))
        }
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[async_trait]
impl IndexStoreReader for FilesystemStore {
    async fn load_state(&self, key: &str) -> Result<Option<IndexState>> {
        let path = self.key_dir(key)?.join(STATE_FILE);
        let state: Option<IndexState> = read_json(&path).await?;
        if let Some(state) = &state {
            ensure_manifest(key, state)?;
        }
        Ok(state)
    }

    async fn load_search(&self, key: &str) -> Result<Option<IndexStateSearchOnly>> {
        read_json(&self.key_dir(key)?.join(SEARCH_FILE)).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to list {}", self.root.display())))
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            let state_path = entry.path().join(STATE_FILE);
            match read_json::<IndexState>(&state_path).await {
                Ok(Some(_)) => keys.push(name),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(key = %name, error = %e, "skipping directory without valid state");
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl IndexStore for FilesystemStore {
    async fn save(
        &self,
        key: &str,
        full: &IndexState,
        search: &IndexStateSearchOnly,
    ) -> Result<()> {
        let dir = self.key_dir(key)?;
        if sanitize_key(key) == ROOT_KEY {
            self.save_in_place(&dir, full, search).await?;
        } else {
            self.save_swapped(&dir, full, search).await?;
        }
        tracing::debug!(key, path = %dir.display(), "saved index state");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let dir = self.key_dir(key)?;
        if dir == self.root {
            bail!(SyncError::config(format!(
                "refusing to delete store root {}",
                self.root.display()
            )));
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(key, path = %dir.display(), "deleted index state");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to delete {}", dir.display()))),
        }
    }
}
