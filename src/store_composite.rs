//! Read-only store spanning several backends under one flat namespace.
//!
//! A [`CompositeStoreReader`] is built once from an ordered list of
//! [`IndexSpec`]s. Each display name maps to a backing store and the key
//! to use against it:
//!
//! | Spec kind | Backing store | Key |
//! |-----------|---------------|-----|
//! | name | shared default store | the name |
//! | `path:` | [`FilesystemStore`] rooted at the path | `.` |
//! | `s3://` | [`ObjectStore`] scoped to bucket + prefix | last URL segment |
//!
//! Only display names are visible to callers. Lookups for names that were
//! never registered return `None`.

use anyhow::Result;
use async_trait::async_trait;
use context_sync_core::index_spec::{assign_display_names, IndexSpec, IndexSpecKind, RemoteLocation};
use context_sync_core::models::{IndexState, IndexStateSearchOnly};
use context_sync_core::store::{IndexStoreReader, ROOT_KEY};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AwsCredentials, ObjectStoreConfig};
use crate::store_fs::FilesystemStore;
use crate::store_s3::ObjectStore;

/// Settings applied to object stores created for `s3://` specs.
#[derive(Debug, Clone, Default)]
pub struct RemoteAccess {
    /// Region, endpoint, and addressing style. Bucket and prefix come from
    /// each URL.
    pub template: Option<ObjectStoreConfig>,
    pub creds: Option<AwsCredentials>,
}

impl RemoteAccess {
    fn store_for(&self, location: &RemoteLocation) -> Result<ObjectStore> {
        let mut config = match &self.template {
            Some(template) => template.clone(),
            None => ObjectStoreConfig::new("", ""),
        };
        config.bucket = location.bucket.clone();
        config.prefix = location.prefix.clone();
        ObjectStore::new(config, self.creds.clone())
    }
}

struct StoreEntry {
    store: Arc<dyn IndexStoreReader>,
    key: String,
}

pub struct CompositeStoreReader {
    entries: HashMap<String, StoreEntry>,
    names: Vec<String>,
}

impl CompositeStoreReader {
    pub fn from_specs(
        specs: &[IndexSpec],
        default_store: Arc<dyn IndexStoreReader>,
        remote: &RemoteAccess,
    ) -> Result<Self> {
        let mut specs = specs.to_vec();
        assign_display_names(&mut specs);

        let mut entries = HashMap::with_capacity(specs.len());
        let mut names = Vec::with_capacity(specs.len());
        for spec in specs {
            let entry = match spec.kind {
                IndexSpecKind::Name => StoreEntry {
                    store: Arc::clone(&default_store),
                    key: spec.value.clone(),
                },
                IndexSpecKind::Path => StoreEntry {
                    store: Arc::new(FilesystemStore::new(crate::config::expand_tilde(
                        std::path::Path::new(&spec.value),
                    ))),
                    key: ROOT_KEY.to_string(),
                },
                IndexSpecKind::RemoteUrl => {
                    let location = RemoteLocation::parse(&spec.value)?;
                    StoreEntry {
                        store: Arc::new(remote.store_for(&location)?),
                        key: location.key,
                    }
                }
            };
            tracing::debug!(name = %spec.display_name, kind = ?spec.kind, value = %spec.value, "registered index");
            names.push(spec.display_name.clone());
            entries.insert(spec.display_name, entry);
        }

        Ok(Self { entries, names })
    }

    /// Display names in spec order.
    pub fn display_names(&self) -> &[String] {
        &self.names
    }

    fn entry(&self, name: &str) -> Option<&StoreEntry> {
        self.entries.get(name)
    }
}

#[async_trait]
impl IndexStoreReader for CompositeStoreReader {
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
        match self.entry(name) {
            Some(entry) => entry.store.load_state(&entry.key).await,
            None => Ok(None),
        }
    }

    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
        match self.entry(name) {
            Some(entry) => entry.store.load_search(&entry.key).await,
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.names.clone())
    }
}
