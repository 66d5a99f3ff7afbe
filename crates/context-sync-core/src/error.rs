//! Error taxonomy for sync and storage operations.
//!
//! Functions across the workspace return `anyhow::Result`; these variants
//! are raised through it so callers can branch with
//! `err.downcast_ref::<SyncError>()`.
//!
//! Conditions that only make an incremental update unsafe are not errors.
//! Sources report them by returning `None` from `fetch_changes`, and the
//! indexer falls back to a full rebuild.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid credentials or identifiers. Raised at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// A remote ref could not be resolved to a commit.
    #[error("failed to resolve ref '{reference}' for {source_id}: {message}")]
    RefResolution {
        source_id: String,
        reference: String,
        message: String,
    },

    /// The requested index or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to delete a key that exists only in a read-only layer.
    #[error("index '{0}' exists only in the read-only remote store and cannot be deleted")]
    RemoteDeleteForbidden(String),

    /// A persisted state file is missing an expected field.
    #[error("corrupt index state for '{key}': {message}")]
    CorruptState { key: String, message: String },
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SyncError::NotFound(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_through_anyhow() {
        let err: anyhow::Error = SyncError::RemoteDeleteForbidden("docs".into()).into();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::RemoteDeleteForbidden(key)) if key == "docs"
        ));
    }

    #[test]
    fn messages_name_the_key() {
        let err = SyncError::CorruptState {
            key: "proj".into(),
            message: "missing blobs".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt index state for 'proj': missing blobs"
        );
        assert_eq!(
            SyncError::not_found("index 'x'").to_string(),
            "not found: index 'x'"
        );
    }
}
