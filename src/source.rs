//! Source connectors and the change-detection protocol.
//!
//! A [`Source`] is one of four connectors (GitHub, GitLab, Bitbucket,
//! website) behind a single set of operations:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | [`fetch_all`](Source::fetch_all) | Complete, filtered file set |
//! | [`fetch_changes`](Source::fetch_changes) | Delta since a previous sync, or `None` |
//! | [`get_metadata`](Source::get_metadata) | Metadata to persist with the index |
//! | [`list_files`](Source::list_files) | One directory level |
//! | [`read_file`](Source::read_file) | One file's contents, or `None` |
//!
//! # Ref pinning
//!
//! VCS connectors resolve their configured ref (branch, tag, `HEAD`, or
//! SHA) to a commit once per instance. Concurrent first callers share a
//! single in-flight resolution, and every later call sees the same commit.
//! Construct a new `Source` to observe new commits.
//!
//! # Incremental safety
//!
//! [`fetch_changes`](Source::fetch_changes) returns `None` whenever a delta
//! cannot be trusted, and the indexer rebuilds from scratch:
//!
//! 1. the previous metadata has no resolved commit (or is another kind)
//! 2. history was rewritten (divergence, a backward move, or a failed comparison)
//! 3. `.gitignore` or `.augmentignore` changed
//! 4. more than [`MAX_INCREMENTAL_CHANGES`] files changed
//!
//! Websites have no stable notion of a delta and always return `None`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use context_sync_core::filter::FileFilter;
use context_sync_core::SyncError;
use context_sync_core::models::{
    FileChanges, FileEntry, FileInfo, SourceKind, SourceMetadata, AUGMENT_IGNORE_FILE,
    GIT_IGNORE_FILE,
};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::io::Read;

use crate::config::{Config, Credentials, SourceConfig, WebsiteDefaults};
use crate::connector_bitbucket::BitbucketSource;
use crate::connector_github::GitHubSource;
use crate::connector_gitlab::GitLabSource;
use crate::connector_website::WebsiteSource;

/// Above this many changed files a full rebuild is cheaper than fetching
/// each file individually.
pub const MAX_INCREMENTAL_CHANGES: usize = 100;

/// Settings shared by all connectors, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub credentials: Credentials,
    pub max_file_size: usize,
    pub website: WebsiteDefaults,
}

impl SourceOptions {
    pub fn from_config(config: &Config, credentials: Credentials) -> Self {
        Self {
            credentials,
            max_file_size: config.filter.max_file_size,
            website: config.website.clone(),
        }
    }
}

/// A content source.
pub enum Source {
    Github(GitHubSource),
    Gitlab(GitLabSource),
    Bitbucket(BitbucketSource),
    Website(WebsiteSource),
}

impl Source {
    /// Build a connector for a configured source.
    ///
    /// Fails with [`SyncError::Config`](context_sync_core::SyncError::Config)
    /// when a required token is missing or an identifier is malformed.
    pub fn from_config(config: &SourceConfig, options: &SourceOptions) -> Result<Self> {
        let creds = &options.credentials;
        Ok(match config {
            SourceConfig::Github(c) => Source::Github(GitHubSource::new(
                c.clone(),
                creds.github_token.clone(),
                options.max_file_size,
            )?),
            SourceConfig::Gitlab(c) => Source::Gitlab(GitLabSource::new(
                c.clone(),
                creds.gitlab_token.clone(),
                options.max_file_size,
            )?),
            SourceConfig::Bitbucket(c) => Source::Bitbucket(BitbucketSource::new(
                c.clone(),
                creds.bitbucket_token.clone(),
                options.max_file_size,
            )?),
            SourceConfig::Website(c) => Source::Website(WebsiteSource::new(
                c.clone(),
                &options.website,
                options.max_file_size,
            )?),
        })
    }

    /// Rebuild the connector an index was created from, pinned to the
    /// commit recorded in its metadata so reads match what was indexed.
    pub fn from_metadata(meta: &SourceMetadata, options: &SourceOptions) -> Result<Self> {
        let creds = &options.credentials;
        let max = options.max_file_size;
        Ok(match meta {
            SourceMetadata::Github(m) => {
                let source = GitHubSource::new(m.config.clone(), creds.github_token.clone(), max)?;
                Source::Github(match &m.resolved_ref {
                    Some(commit) => source.pinned(commit.clone()),
                    None => source,
                })
            }
            SourceMetadata::Gitlab(m) => {
                let source = GitLabSource::new(m.config.clone(), creds.gitlab_token.clone(), max)?;
                Source::Gitlab(match &m.resolved_ref {
                    Some(commit) => source.pinned(commit.clone()),
                    None => source,
                })
            }
            SourceMetadata::Bitbucket(m) => {
                let source =
                    BitbucketSource::new(m.config.clone(), creds.bitbucket_token.clone(), max)?;
                Source::Bitbucket(match &m.resolved_ref {
                    Some(commit) => source.pinned(commit.clone()),
                    None => source,
                })
            }
            SourceMetadata::Website(m) => {
                Source::Website(WebsiteSource::new(m.config.clone(), &options.website, max)?)
            }
        })
    }

    pub async fn fetch_all(&self) -> Result<Vec<FileEntry>> {
        match self {
            Source::Github(s) => vcs_fetch_all(s, s.max_file_size()).await,
            Source::Gitlab(s) => vcs_fetch_all(s, s.max_file_size()).await,
            Source::Bitbucket(s) => vcs_fetch_all(s, s.max_file_size()).await,
            Source::Website(s) => s.fetch_all().await,
        }
    }

    pub async fn fetch_changes(&self, previous: &SourceMetadata) -> Result<Option<FileChanges>> {
        if previous.kind() != self.kind() {
            return Ok(None);
        }
        let previous_ref = previous.resolved_ref();
        match self {
            Source::Github(s) => vcs_fetch_changes(s, previous_ref, s.max_file_size()).await,
            Source::Gitlab(s) => vcs_fetch_changes(s, previous_ref, s.max_file_size()).await,
            Source::Bitbucket(s) => vcs_fetch_changes(s, previous_ref, s.max_file_size()).await,
            Source::Website(_) => Ok(None),
        }
    }

    pub async fn get_metadata(&self) -> Result<SourceMetadata> {
        match self {
            Source::Github(s) => s.metadata().await,
            Source::Gitlab(s) => s.metadata().await,
            Source::Bitbucket(s) => s.metadata().await,
            Source::Website(s) => Ok(s.metadata()),
        }
    }

    /// Immediate children of `directory` (`""` for the root).
    pub async fn list_files(&self, directory: &str) -> Result<Vec<FileInfo>> {
        let directory = directory.trim_matches('/');
        match self {
            Source::Github(s) => s.list_dir(&s.commit().await?, directory).await,
            Source::Gitlab(s) => s.list_dir(&s.commit().await?, directory).await,
            Source::Bitbucket(s) => s.list_dir(&s.commit().await?, directory).await,
            Source::Website(s) => s.list_files(directory).await,
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let path = path.trim_start_matches('/');
        let bytes = match self {
            Source::Github(s) => s.download(&s.commit().await?, path).await?,
            Source::Gitlab(s) => s.download(&s.commit().await?, path).await?,
            Source::Bitbucket(s) => s.download(&s.commit().await?, path).await?,
            Source::Website(s) => return s.read_file(path).await,
        };
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// The pinned commit for VCS sources; `None` for websites.
    pub async fn resolved_ref(&self) -> Result<Option<String>> {
        match self {
            Source::Github(s) => s.commit().await.map(Some),
            Source::Gitlab(s) => s.commit().await.map(Some),
            Source::Bitbucket(s) => s.commit().await.map(Some),
            Source::Website(_) => Ok(None),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Github(_) => SourceKind::Github,
            Source::Gitlab(_) => SourceKind::Gitlab,
            Source::Bitbucket(_) => SourceKind::Bitbucket,
            Source::Website(_) => SourceKind::Website,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// VCS change detection
// ═══════════════════════════════════════════════════════════════════════

/// How one path changed between two commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Modified,
    Removed,
    Renamed { from: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: String,
    pub status: ChangeStatus,
}

impl ChangedFile {
    pub fn new(path: impl Into<String>, status: ChangeStatus) -> Self {
        Self {
            path: path.into(),
            status,
        }
    }

    fn touches_ignore_rules(&self) -> bool {
        let is_rules = |p: &str| {
            let name = p.rsplit('/').next().unwrap_or(p);
            name == GIT_IGNORE_FILE || name == AUGMENT_IGNORE_FILE
        };
        is_rules(&self.path)
            || matches!(&self.status, ChangeStatus::Renamed { from } if is_rules(from))
    }
}

/// Result of comparing a previously indexed commit with the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// Current commit linearly extends the previous one.
    Linear(Vec<ChangedFile>),
    /// History was rewritten; the reason is logged.
    Unsafe(String),
}

/// Operations each VCS connector provides to the shared driver.
#[async_trait]
pub(crate) trait VcsBackend: Send + Sync {
    /// `owner/repo`-style label for logs and errors.
    fn label(&self) -> String;

    /// The pinned commit, resolving it on first use.
    async fn commit(&self) -> Result<String>;

    async fn compare(&self, base: &str, head: &str) -> Result<Comparison>;

    /// Raw bytes of `path` at `commit`, or `None` if absent.
    async fn download(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>>;

    /// Every file at `commit` as `(path, bytes)`.
    async fn snapshot(&self, commit: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

async fn vcs_fetch_all<B: VcsBackend>(backend: &B, max_file_size: usize) -> Result<Vec<FileEntry>> {
    let commit = backend.commit().await?;
    let files = backend.snapshot(&commit).await?;
    let total = files.len();
    let filter = FileFilter::from_snapshot(&files, max_file_size)?;
    let entries = filter.apply(files);
    tracing::info!(
        source = %backend.label(),
        commit = %commit,
        total,
        included = entries.len(),
        "fetched snapshot"
    );
    Ok(entries)
}

pub(crate) async fn vcs_fetch_changes<B: VcsBackend>(
    backend: &B,
    previous_ref: Option<&str>,
    max_file_size: usize,
) -> Result<Option<FileChanges>> {
    let label = backend.label();
    let Some(previous) = previous_ref else {
        tracing::info!(source = %label, "no previous commit recorded; full index required");
        return Ok(None);
    };

    let current = backend.commit().await?;
    if current == previous {
        return Ok(Some(FileChanges::default()));
    }

    let changed = match backend.compare(previous, &current).await {
        Ok(Comparison::Linear(files)) => files,
        Ok(Comparison::Unsafe(reason)) => {
            tracing::info!(source = %label, from = %previous, to = %current, %reason, "history rewritten; full index required");
            return Ok(None);
        }
        Err(e) => {
            tracing::warn!(source = %label, from = %previous, to = %current, error = %e, "comparison failed; full index required");
            return Ok(None);
        }
    };

    if changed.iter().any(ChangedFile::touches_ignore_rules) {
        tracing::info!(source = %label, "ignore rules changed; full index required");
        return Ok(None);
    }
    if changed.len() > MAX_INCREMENTAL_CHANGES {
        tracing::info!(
            source = %label,
            changed = changed.len(),
            limit = MAX_INCREMENTAL_CHANGES,
            "too many changed files; full index required"
        );
        return Ok(None);
    }

    let augment = backend.download(&current, AUGMENT_IGNORE_FILE).await?;
    let git = backend.download(&current, GIT_IGNORE_FILE).await?;
    let filter = FileFilter::new(
        augment.as_deref().map(String::from_utf8_lossy).as_deref(),
        git.as_deref().map(String::from_utf8_lossy).as_deref(),
        max_file_size,
    )?;

    let mut changes = FileChanges::default();
    for file in changed {
        let is_new = match &file.status {
            ChangeStatus::Removed => {
                changes.removed.push(file.path);
                continue;
            }
            ChangeStatus::Renamed { from } => {
                changes.removed.push(from.clone());
                true
            }
            ChangeStatus::Added => true,
            ChangeStatus::Modified => false,
        };

        let Some(bytes) = backend.download(&current, &file.path).await? else {
            tracing::debug!(source = %label, path = %file.path, "changed file missing at head");
            if !is_new {
                changes.removed.push(file.path);
            }
            continue;
        };
        match filter.admit(&file.path, bytes) {
            Some(entry) if is_new => changes.added.push(entry),
            Some(entry) => changes.modified.push(entry),
            None => {
                // Now excluded: drop any stale copy from the index.
                if !is_new {
                    changes.removed.push(file.path);
                }
            }
        }
    }

    tracing::info!(
        source = %label,
        from = %previous,
        to = %current,
        added = changes.added.len(),
        modified = changes.modified.len(),
        removed = changes.removed.len(),
        "computed incremental changes"
    );
    Ok(Some(changes))
}

// ═══════════════════════════════════════════════════════════════════════
// Construction helpers
// ═══════════════════════════════════════════════════════════════════════

/// A non-empty token or a config error naming the variable to set.
pub(crate) fn require_token(token: Option<String>, var: &str, kind: &str) -> Result<String> {
    match token {
        Some(t) if !t.trim().is_empty() => Ok(t),
        _ => Err(SyncError::config(format!("{} is required for {} sources", var, kind)).into()),
    }
}

/// Reject empty identifiers and identifiers containing whitespace.
pub(crate) fn require_field(kind: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!(SyncError::config(format!("{} source: '{}' must not be empty", kind, field)));
    }
    if value.contains(char::is_whitespace) {
        bail!(SyncError::config(format!(
            "{} source: '{}' must not contain whitespace: '{}'",
            kind, field, value
        )));
    }
    Ok(())
}

pub(crate) fn ref_error(source_id: &str, reference: &str, message: impl Into<String>) -> anyhow::Error {
    SyncError::RefResolution {
        source_id: source_id.to_string(),
        reference: reference.to_string(),
        message: message.into(),
    }
    .into()
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP helpers
// ═══════════════════════════════════════════════════════════════════════

/// `base` with `segments` appended, each percent-encoded as one segment.
pub(crate) fn api_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid API base URL '{}'", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("API base URL '{}' cannot have a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Split a repository path into URL segments.
pub(crate) fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

async fn send_checked(req: RequestBuilder, what: &str) -> Result<Option<reqwest::Response>> {
    let resp = req
        .send()
        .await
        .with_context(|| format!("request failed: {}", what))?;
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!(
            "{} failed (HTTP {}): {}",
            what,
            status,
            body.chars().take(500).collect::<String>()
        );
    }
    Ok(Some(resp))
}

/// Send a request and decode JSON. 404 → `None`.
pub(crate) async fn get_json<T: DeserializeOwned>(req: RequestBuilder, what: &str) -> Result<Option<T>> {
    match send_checked(req, what).await? {
        Some(resp) => {
            let value = resp
                .json::<T>()
                .await
                .with_context(|| format!("invalid response from {}", what))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Send a request and return the body with its response headers. 404 → `None`.
pub(crate) async fn get_json_with_headers<T: DeserializeOwned>(
    req: RequestBuilder,
    what: &str,
) -> Result<Option<(T, reqwest::header::HeaderMap)>> {
    match send_checked(req, what).await? {
        Some(resp) => {
            let headers = resp.headers().clone();
            let value = resp
                .json::<T>()
                .await
                .with_context(|| format!("invalid response from {}", what))?;
            Ok(Some((value, headers)))
        }
        None => Ok(None),
    }
}

/// Send a request and return the raw body. 404 → `None`.
pub(crate) async fn get_bytes(req: RequestBuilder, what: &str) -> Result<Option<Vec<u8>>> {
    match send_checked(req, what).await? {
        Some(resp) => Ok(Some(resp.bytes().await?.to_vec())),
        None => Ok(None),
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("context-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Unpack a repository archive, dropping the single top-level directory
/// that GitHub and GitLab wrap their archives in.
pub(crate) async fn extract_archive(bytes: Vec<u8>) -> Result<Vec<(String, Vec<u8>)>> {
    tokio::task::spawn_blocking(move || extract_archive_sync(&bytes))
        .await
        .context("archive extraction task failed")?
}

fn extract_archive_sync(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).context("invalid zip archive")?;
    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let Some((_, rel)) = name.split_once('/') else {
            continue;
        };
        if rel.is_empty() {
            continue;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .with_context(|| format!("failed to read '{}' from archive", name))?;
        files.push((rel.to_string(), contents));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
