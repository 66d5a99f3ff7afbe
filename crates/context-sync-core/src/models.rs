//! Core data models used throughout Context Sync.
//!
//! These types describe where an index came from ([`SourceMetadata`]), what
//! was persisted for it ([`IndexState`], [`IndexStateSearchOnly`]), and the
//! file sets that flow from sources into the context engine.
//!
//! All persisted types serialize to camelCase JSON so state written by one
//! backend can be read by any other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version stamped into every persisted [`IndexState`].
pub const STATE_VERSION: u32 = 1;

/// Field of the engine export that holds the complete blob manifest.
///
/// Present only in full exports. A full state without it cannot be used
/// for incremental indexing.
pub const MANIFEST_FIELD: &str = "blobs";

/// Ignore files whose rules feed the [`FileFilter`](crate::filter::FileFilter).
pub const AUGMENT_IGNORE_FILE: &str = ".augmentignore";
pub const GIT_IGNORE_FILE: &str = ".gitignore";

// ═══════════════════════════════════════════════════════════════════════
// Source configuration
// ═══════════════════════════════════════════════════════════════════════

/// GitHub repository: `{owner, repo, ref?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubSourceConfig {
    pub owner: String,
    pub repo: String,
    /// Branch, tag, `HEAD`, or commit SHA. Defaults to `HEAD`.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// API base for GitHub Enterprise. Defaults to `https://api.github.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// GitLab project: `{projectId, ref?, baseUrl?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitLabSourceConfig {
    /// Numeric id or `group/project` path.
    pub project_id: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Instance URL. Defaults to `https://gitlab.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Bitbucket repository: `{workspace, repo, ref?, baseUrl?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitBucketSourceConfig {
    pub workspace: String,
    pub repo: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// API base. Defaults to `https://api.bitbucket.org/2.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Website crawl: `{url, maxDepth?, maxPages?, includePaths?, excludePaths?,
/// respectRobotsTxt?, userAgent?, delayMs?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteSourceConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respect_robots_txt: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl WebsiteSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_depth: None,
            max_pages: None,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            respect_robots_txt: None,
            user_agent: None,
            delay_ms: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Source metadata
// ═══════════════════════════════════════════════════════════════════════

/// Metadata recorded for a version-controlled source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcsMetadata<C> {
    pub config: C,
    /// Commit the index was built from. Authoritative over `config.ref`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_ref: Option<String>,
    pub synced_at: DateTime<Utc>,
}

/// Metadata recorded for a crawled website. Crawls have no stable ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteMetadata {
    pub config: WebsiteSourceConfig,
    pub synced_at: DateTime<Utc>,
}

/// Where an index came from, tagged by source kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceMetadata {
    Github(VcsMetadata<GitHubSourceConfig>),
    Gitlab(VcsMetadata<GitLabSourceConfig>),
    Bitbucket(VcsMetadata<BitBucketSourceConfig>),
    Website(WebsiteMetadata),
}

/// The four supported source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Github,
    Gitlab,
    Bitbucket,
    Website,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Github => "github",
            SourceKind::Gitlab => "gitlab",
            SourceKind::Bitbucket => "bitbucket",
            SourceKind::Website => "website",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SourceMetadata {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceMetadata::Github(_) => SourceKind::Github,
            SourceMetadata::Gitlab(_) => SourceKind::Gitlab,
            SourceMetadata::Bitbucket(_) => SourceKind::Bitbucket,
            SourceMetadata::Website(_) => SourceKind::Website,
        }
    }

    /// The commit the index was built from, if the source has one.
    pub fn resolved_ref(&self) -> Option<&str> {
        match self {
            SourceMetadata::Github(m) => m.resolved_ref.as_deref(),
            SourceMetadata::Gitlab(m) => m.resolved_ref.as_deref(),
            SourceMetadata::Bitbucket(m) => m.resolved_ref.as_deref(),
            SourceMetadata::Website(_) => None,
        }
    }

    /// The human-entered ref (branch, tag, ...), if any.
    pub fn configured_ref(&self) -> Option<&str> {
        match self {
            SourceMetadata::Github(m) => m.config.git_ref.as_deref(),
            SourceMetadata::Gitlab(m) => m.config.git_ref.as_deref(),
            SourceMetadata::Bitbucket(m) => m.config.git_ref.as_deref(),
            SourceMetadata::Website(_) => None,
        }
    }

    /// Human-readable identifier: `owner/repo`, project id, or URL.
    pub fn identifier(&self) -> String {
        match self {
            SourceMetadata::Github(m) => format!("{}/{}", m.config.owner, m.config.repo),
            SourceMetadata::Gitlab(m) => m.config.project_id.clone(),
            SourceMetadata::Bitbucket(m) => format!("{}/{}", m.config.workspace, m.config.repo),
            SourceMetadata::Website(m) => m.config.url.clone(),
        }
    }

    pub fn synced_at(&self) -> DateTime<Utc> {
        match self {
            SourceMetadata::Github(m) => m.synced_at,
            SourceMetadata::Gitlab(m) => m.synced_at,
            SourceMetadata::Bitbucket(m) => m.synced_at,
            SourceMetadata::Website(m) => m.synced_at,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Persisted index state
// ═══════════════════════════════════════════════════════════════════════

/// Full index state: engine export including the blob manifest.
///
/// Required for incremental re-indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexState {
    pub version: u32,
    pub context_state: serde_json::Value,
    pub source: SourceMetadata,
}

impl IndexState {
    /// Whether the engine export carries its blob manifest.
    pub fn has_manifest(&self) -> bool {
        self.context_state.get(MANIFEST_FIELD).is_some()
    }
}

/// Search-only index state: minimal engine export, no manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStateSearchOnly {
    pub version: u32,
    pub context_state: serde_json::Value,
    pub source: SourceMetadata,
}

// ═══════════════════════════════════════════════════════════════════════
// Files
// ═══════════════════════════════════════════════════════════════════════

/// A file with its text contents, as fed to the context engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub contents: String,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
}

/// A single-level directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
}

/// Delta between two snapshots of a source.
///
/// A rename appears as its old path in `removed` and its new path in
/// `added` or `modified`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanges {
    pub added: Vec<FileEntry>,
    pub modified: Vec<FileEntry>,
    pub removed: Vec<String>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}
