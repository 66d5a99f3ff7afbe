//! # Context Sync Core
//!
//! Shared, I/O-free logic for Context Sync: index state models, the error
//! taxonomy, the file filter pipeline, index spec parsing, the store
//! abstraction, and the context engine contract.
//!
//! This crate contains no tokio, HTTP, or filesystem I/O. Network-backed
//! sources and disk/object stores live in the `context-sync` crate.

pub mod engine;
pub mod error;
pub mod filter;
pub mod index_spec;
pub mod models;
pub mod store;

pub use error::SyncError;
