//! # Context Sync
//!
//! Keeps context-engine indexes in step with remote sources.
//!
//! Context Sync pulls files from GitHub, GitLab, Bitbucket, or a crawled
//! website, filters them, feeds them to a context engine, and persists the
//! engine's exported state so later runs can update it incrementally and
//! query clients can load it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────┐   ┌─────────────┐
//! │  Sources    │──▶│  Filter  │──▶│ Indexer  │──▶│   Stores    │
//! │ GH/GL/BB/Web│   │ ignore + │   │ full /   │   │ FS / S3 /   │
//! └─────────────┘   │ size/bin │   │ delta    │   │ layered     │
//!                   └──────────┘   └──────────┘   └──────┬──────┘
//!                                                        │
//!                                                        ▼
//!                                                 ┌─────────────┐
//!                                                 │ Client cache│
//!                                                 │ search/ls/  │
//!                                                 │ cat         │
//!                                                 └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ctx-sync index github:widgets          # full, then incremental
//! ctx-sync list
//! ctx-sync search widgets "retry policy"
//! ctx-sync ls widgets src/
//! ctx-sync cat widgets README.md
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and credentials |
//! | [`source`] | Source enum and shared change detection |
//! | [`connector_github`] | GitHub connector |
//! | [`connector_gitlab`] | GitLab connector |
//! | [`connector_bitbucket`] | Bitbucket Cloud connector |
//! | [`connector_website`] | Website crawler |
//! | [`store_fs`] | Filesystem index store |
//! | [`store_s3`] | S3-compatible index store |
//! | [`store_composite`] | Read-only store over index specs |
//! | [`store_layered`] | Local-over-remote store layering |
//! | [`indexer`] | Full / incremental index runs |
//! | [`clients`] | Lazily built per-index query clients |
//!
//! Shared models, the file filter, index specs, the store traits and the
//! context engine contract live in [`context_sync_core`].

pub mod clients;
pub mod config;
pub mod connector_bitbucket;
pub mod connector_github;
pub mod connector_gitlab;
pub mod connector_website;
pub mod indexer;
pub mod source;
pub mod store_composite;
pub mod store_fs;
pub mod store_layered;
pub mod store_s3;
