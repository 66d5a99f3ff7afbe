//! Bitbucket Cloud repository connector.
//!
//! Uses the Bitbucket 2.0 REST API under
//! `{baseUrl}/repositories/{workspace}/{repo}`. Bitbucket offers no archive
//! endpoint in its API, so full snapshots walk the `src` listing
//! breadth-first and download each file.
//!
//! History rewrites are detected with `merge-base/{new}..{old}`: the
//! previously indexed commit must be the merge base.
//!
//! # Configuration
//!
//! ```toml
//! [sources.bitbucket.api]
//! workspace = "acme"
//! repo = "api"
//! ref = "main"
//! ```
//!
//! Requires `BITBUCKET_TOKEN` (repository or workspace access token).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use context_sync_core::models::{
    BitBucketSourceConfig, FileInfo, FileType, SourceMetadata, VcsMetadata,
};
use reqwest::{RequestBuilder, Url};
use serde::Deserialize;
use std::collections::VecDeque;
use tokio::sync::OnceCell;

use crate::source::{
    api_url, get_bytes, get_json, http_client, path_segments, ref_error, require_field,
    require_token, ChangeStatus, ChangedFile, Comparison, VcsBackend, MAX_INCREMENTAL_CHANGES,
};

pub const DEFAULT_API_URL: &str = "https://api.bitbucket.org/2.0";

const PAGE_LEN: &str = "100";

pub struct BitbucketSource {
    config: BitBucketSourceConfig,
    base_url: String,
    token: String,
    client: reqwest::Client,
    resolved: OnceCell<String>,
    max_file_size: usize,
}

#[derive(Deserialize)]
struct Commit {
    hash: String,
}

#[derive(Deserialize)]
struct Repository {
    mainbranch: Option<Branch>,
}

#[derive(Deserialize)]
struct Branch {
    name: String,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct DiffStat {
    status: String,
    #[serde(default)]
    old: Option<PathRef>,
    #[serde(default)]
    new: Option<PathRef>,
}

#[derive(Deserialize)]
struct PathRef {
    path: String,
}

#[derive(Deserialize)]
struct SrcEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

impl BitbucketSource {
    pub fn new(
        config: BitBucketSourceConfig,
        token: Option<String>,
        max_file_size: usize,
    ) -> Result<Self> {
        let token = require_token(token, "BITBUCKET_TOKEN", "Bitbucket")?;
        require_field("Bitbucket", "workspace", &config.workspace)?;
        require_field("Bitbucket", "repo", &config.repo)?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Ok(Self {
            config,
            base_url,
            token,
            client: http_client()?,
            resolved: OnceCell::new(),
            max_file_size,
        })
    }

    /// Skip ref resolution and use `commit` for every operation.
    pub fn pinned(mut self, commit: String) -> Self {
        self.resolved = OnceCell::new_with(Some(commit));
        self
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    fn repo_url(&self, tail: &[&str]) -> Result<Url> {
        let mut segments = vec![
            "repositories",
            self.config.workspace.as_str(),
            self.config.repo.as_str(),
        ];
        segments.extend_from_slice(tail);
        api_url(&self.base_url, &segments)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        self.client.get(url).bearer_auth(&self.token)
    }

    /// `src/{commit}/{directory}/` listing URL.
    fn src_url(&self, commit: &str, directory: &str) -> Result<Url> {
        let mut tail = vec!["src", commit];
        tail.extend(path_segments(directory));
        tail.push("");
        self.repo_url(&tail)
    }

    /// Follow `next` links until exhausted or `limit` values collected.
    async fn paginate<T: serde::de::DeserializeOwned>(
        &self,
        first: RequestBuilder,
        what: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<T>>> {
        let Some(mut page) = get_json::<Page<T>>(first, what).await? else {
            return Ok(None);
        };
        let mut values = std::mem::take(&mut page.values);
        while let Some(next) = page.next.take() {
            if limit.is_some_and(|l| values.len() > l) {
                break;
            }
            let url = Url::parse(&next).with_context(|| format!("invalid next link '{}'", next))?;
            page = get_json::<Page<T>>(self.get(url), what)
                .await?
                .unwrap_or(Page {
                    values: Vec::new(),
                    next: None,
                });
            values.append(&mut page.values);
        }
        Ok(Some(values))
    }

    async fn default_branch(&self) -> Result<String> {
        let repo = get_json::<Repository>(self.get(self.repo_url(&[])?), "Bitbucket repository")
            .await?
            .ok_or_else(|| ref_error(&self.label(), "HEAD", "repository not found"))?;
        repo.mainbranch
            .map(|b| b.name)
            .ok_or_else(|| ref_error(&self.label(), "HEAD", "repository has no main branch"))
    }

    async fn resolve_remote(&self) -> Result<String> {
        let reference = match self.config.git_ref.as_deref() {
            Some(r) if r != "HEAD" => r.to_string(),
            _ => self.default_branch().await?,
        };
        let url = self.repo_url(&["commit", &reference])?;
        tracing::debug!(source = %self.label(), reference = %reference, "resolving ref");
        match get_json::<Commit>(self.get(url), "Bitbucket commit lookup").await {
            Ok(Some(commit)) => Ok(commit.hash),
            Ok(None) => Err(ref_error(&self.label(), &reference, "no such ref")),
            Err(e) => Err(ref_error(&self.label(), &reference, format!("{:#}", e))),
        }
    }

    pub(crate) async fn metadata(&self) -> Result<SourceMetadata> {
        Ok(SourceMetadata::Bitbucket(VcsMetadata {
            config: self.config.clone(),
            resolved_ref: Some(self.commit().await?),
            synced_at: Utc::now(),
        }))
    }

    pub(crate) async fn list_dir(&self, commit: &str, directory: &str) -> Result<Vec<FileInfo>> {
        let req = self
            .get(self.src_url(commit, directory)?)
            .query(&[("pagelen", PAGE_LEN)]);
        let entries: Vec<SrcEntry> = self
            .paginate(req, "Bitbucket src listing", None)
            .await?
            .unwrap_or_default();
        let mut files: Vec<FileInfo> = entries
            .into_iter()
            .map(|e| FileInfo {
                path: e.path,
                file_type: if e.kind == "commit_directory" {
                    FileType::Directory
                } else {
                    FileType::File
                },
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

#[async_trait]
impl VcsBackend for BitbucketSource {
    fn label(&self) -> String {
        format!("bitbucket:{}/{}", self.config.workspace, self.config.repo)
    }

    async fn commit(&self) -> Result<String> {
        self.resolved
            .get_or_try_init(|| self.resolve_remote())
            .await
            .cloned()
    }

    async fn compare(&self, base: &str, head: &str) -> Result<Comparison> {
        let spec = format!("{}..{}", head, base);

        let merge_base = get_json::<Commit>(
            self.get(self.repo_url(&["merge-base", &spec])?),
            "Bitbucket merge base",
        )
        .await?;
        match merge_base {
            Some(c) if c.hash.starts_with(base) || base.starts_with(&c.hash) => {}
            Some(c) => {
                return Ok(Comparison::Unsafe(format!(
                    "merge base {} is not the indexed commit",
                    c.hash
                )))
            }
            None => return Ok(Comparison::Unsafe("no merge base".to_string())),
        }

        let req = self
            .get(self.repo_url(&["diffstat", &spec])?)
            .query(&[("pagelen", PAGE_LEN)]);
        let Some(stats) = self
            .paginate::<DiffStat>(req, "Bitbucket diffstat", Some(MAX_INCREMENTAL_CHANGES))
            .await?
        else {
            return Ok(Comparison::Unsafe(format!("commit {} no longer exists", base)));
        };

        let files = stats
            .into_iter()
            .filter_map(|s| {
                let old = s.old.map(|p| p.path);
                let new = s.new.map(|p| p.path);
                match (s.status.as_str(), old, new) {
                    ("removed", Some(old), _) => Some(ChangedFile::new(old, ChangeStatus::Removed)),
                    ("added", _, Some(new)) => Some(ChangedFile::new(new, ChangeStatus::Added)),
                    ("renamed", Some(old), Some(new)) if old != new => {
                        Some(ChangedFile::new(new, ChangeStatus::Renamed { from: old }))
                    }
                    (_, _, Some(new)) => Some(ChangedFile::new(new, ChangeStatus::Modified)),
                    (_, Some(old), None) => Some(ChangedFile::new(old, ChangeStatus::Removed)),
                    _ => None,
                }
            })
            .collect();
        Ok(Comparison::Linear(files))
    }

    async fn download(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let mut tail = vec!["src", commit];
        tail.extend(path_segments(path));
        get_bytes(self.get(self.repo_url(&tail)?), "Bitbucket file download").await
    }

    async fn snapshot(&self, commit: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut files = Vec::new();
        let mut queue = VecDeque::from([String::new()]);
        while let Some(dir) = queue.pop_front() {
            for entry in self.list_dir(commit, &dir).await? {
                match entry.file_type {
                    FileType::Directory => queue.push_back(entry.path),
                    FileType::File => {
                        if let Some(bytes) = self.download(commit, &entry.path).await? {
                            files.push((entry.path, bytes));
                        }
                    }
                }
            }
        }
        tracing::debug!(source = %self.label(), commit, files = files.len(), "walked repository");
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}
