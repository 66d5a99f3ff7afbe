//! GitLab project connector.
//!
//! All calls go to `{baseUrl}/api/v4/projects/{projectId}/repository/...`,
//! with the project id (numeric or `group/project`) URL-encoded as a single
//! path segment and authenticated via the `PRIVATE-TOKEN` header.
//!
//! History rewrites are detected with `merge_base`: the previously indexed
//! commit must be the merge base of itself and the new head.
//!
//! # Configuration
//!
//! ```toml
//! [sources.gitlab.infra]
//! projectId = "acme/infra"
//! ref = "main"
//! # baseUrl = "https://gitlab.acme.dev"
//! ```
//!
//! Requires `GITLAB_TOKEN`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use context_sync_core::models::{
    FileInfo, FileType, GitLabSourceConfig, SourceMetadata, VcsMetadata,
};
use context_sync_core::SyncError;
use reqwest::{RequestBuilder, Url};
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::source::{
    api_url, extract_archive, get_bytes, get_json, get_json_with_headers, http_client, ref_error,
    require_field, require_token, ChangeStatus, ChangedFile, Comparison, VcsBackend,
};

pub const DEFAULT_BASE_URL: &str = "https://gitlab.com";

const PAGE_SIZE: &str = "100";

pub struct GitLabSource {
    config: GitLabSourceConfig,
    api_base: String,
    token: String,
    client: reqwest::Client,
    resolved: OnceCell<String>,
    max_file_size: usize,
}

#[derive(Deserialize)]
struct Commit {
    id: String,
}

#[derive(Deserialize)]
struct CompareResponse {
    #[serde(default)]
    diffs: Vec<Diff>,
}

#[derive(Deserialize)]
struct Diff {
    old_path: String,
    new_path: String,
    #[serde(default)]
    new_file: bool,
    #[serde(default)]
    renamed_file: bool,
    #[serde(default)]
    deleted_file: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

impl GitLabSource {
    pub fn new(
        config: GitLabSourceConfig,
        token: Option<String>,
        max_file_size: usize,
    ) -> Result<Self> {
        let token = require_token(token, "GITLAB_TOKEN", "GitLab")?;
        require_field("GitLab", "projectId", &config.project_id)?;
        let base = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let api_base = format!("{}/api/v4", base);
        Url::parse(&api_base)
            .map_err(|e| SyncError::config(format!("GitLab source: invalid baseUrl '{}': {}", base, e)))?;
        Ok(Self {
            config,
            api_base,
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

    fn git_ref(&self) -> &str {
        self.config.git_ref.as_deref().unwrap_or("HEAD")
    }

    fn repo_url(&self, tail: &[&str]) -> Result<Url> {
        let mut segments = vec!["projects", self.config.project_id.as_str(), "repository"];
        segments.extend_from_slice(tail);
        api_url(&self.api_base, &segments)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        self.client.get(url).header("PRIVATE-TOKEN", &self.token)
    }

    async fn resolve_remote(&self) -> Result<String> {
        let reference = self.git_ref();
        let url = self.repo_url(&["commits", reference])?;
        tracing::debug!(source = %self.label(), reference, "resolving ref");
        match get_json::<Commit>(self.get(url), "GitLab commit lookup").await {
            Ok(Some(commit)) => Ok(commit.id),
            Ok(None) => Err(ref_error(&self.label(), reference, "no such ref")),
            Err(e) => Err(ref_error(&self.label(), reference, format!("{:#}", e))),
        }
    }

    async fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>> {
        let req = self
            .get(self.repo_url(&["merge_base"])?)
            .query(&[("refs[]", a), ("refs[]", b)]);
        Ok(get_json::<Commit>(req, "GitLab merge base")
            .await?
            .map(|c| c.id))
    }

    pub(crate) async fn metadata(&self) -> Result<SourceMetadata> {
        Ok(SourceMetadata::Gitlab(VcsMetadata {
            config: self.config.clone(),
            resolved_ref: Some(self.commit().await?),
            synced_at: Utc::now(),
        }))
    }

    /// Tree entries under `directory`, following `x-next-page`.
    async fn tree(&self, commit: &str, directory: &str, recursive: bool) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();
        let mut page = "1".to_string();
        loop {
            let mut query = vec![
                ("ref", commit.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.clone()),
            ];
            if !directory.is_empty() {
                query.push(("path", directory.to_string()));
            }
            if recursive {
                query.push(("recursive", "true".to_string()));
            }
            let req = self.get(self.repo_url(&["tree"])?).query(&query);
            let Some((batch, headers)) =
                get_json_with_headers::<Vec<TreeEntry>>(req, "GitLab tree listing").await?
            else {
                break;
            };
            entries.extend(batch);

            match headers
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.trim().is_empty())
            {
                Some(next) => page = next.trim().to_string(),
                None => break,
            }
        }
        Ok(entries)
    }

    pub(crate) async fn list_dir(&self, commit: &str, directory: &str) -> Result<Vec<FileInfo>> {
        let mut files: Vec<FileInfo> = self
            .tree(commit, directory, false)
            .await?
            .into_iter()
            .map(|e| FileInfo {
                path: e.path,
                file_type: if e.kind == "tree" {
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
impl VcsBackend for GitLabSource {
    fn label(&self) -> String {
        format!("gitlab:{}", self.config.project_id)
    }

    async fn commit(&self) -> Result<String> {
        self.resolved
            .get_or_try_init(|| self.resolve_remote())
            .await
            .cloned()
    }

    async fn compare(&self, base: &str, head: &str) -> Result<Comparison> {
        match self.merge_base(base, head).await? {
            Some(merge_base) if merge_base == base => {}
            Some(merge_base) => {
                return Ok(Comparison::Unsafe(format!(
                    "merge base {} is not the indexed commit",
                    merge_base
                )))
            }
            None => return Ok(Comparison::Unsafe("no merge base".to_string())),
        }

        let req = self
            .get(self.repo_url(&["compare"])?)
            .query(&[("from", base), ("to", head)]);
        let Some(resp) = get_json::<CompareResponse>(req, "GitLab compare").await? else {
            return Ok(Comparison::Unsafe(format!("commit {} no longer exists", base)));
        };

        let files = resp
            .diffs
            .into_iter()
            .map(|d| {
                if d.deleted_file {
                    ChangedFile::new(d.old_path, ChangeStatus::Removed)
                } else if d.renamed_file {
                    ChangedFile::new(d.new_path, ChangeStatus::Renamed { from: d.old_path })
                } else if d.new_file {
                    ChangedFile::new(d.new_path, ChangeStatus::Added)
                } else {
                    ChangedFile::new(d.new_path, ChangeStatus::Modified)
                }
            })
            .collect();
        Ok(Comparison::Linear(files))
    }

    async fn download(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let url = self.repo_url(&["files", path, "raw"])?;
        get_bytes(self.get(url).query(&[("ref", commit)]), "GitLab file download").await
    }

    async fn snapshot(&self, commit: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let req = self
            .get(self.repo_url(&["archive.zip"])?)
            .query(&[("sha", commit)]);
        let bytes = get_bytes(req, "GitLab archive download")
            .await?
            .ok_or_else(|| SyncError::not_found(format!("archive for {} at {}", self.label(), commit)))?;
        tracing::debug!(source = %self.label(), commit, bytes = bytes.len(), "downloaded archive");
        extract_archive(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GitLabSourceConfig {
        GitLabSourceConfig {
            project_id: "acme/infra".into(),
            git_ref: Some("main".into()),
            base_url: Some("https://gitlab.acme.dev/".into()),
        }
    }

    #[test]
    fn requires_token_and_project() {
        assert!(GitLabSource::new(config(), None, 1024).is_err());
        let mut cfg = config();
        cfg.project_id = String::new();
        assert!(GitLabSource::new(cfg, Some("t".into()), 1024).is_err());
    }

    #[test]
    fn project_path_and_file_path_are_single_segments() {
        let source = GitLabSource::new(config(), Some("t".into()), 1024).unwrap();
        assert_eq!(
            source
                .repo_url(&["files", "docs/setup guide.md", "raw"])
                .unwrap()
                .as_str(),
            "https://gitlab.acme.dev/api/v4/projects/acme%2Finfra/repository/files/docs%2Fsetup%20guide.md/raw"
        );
    }

    #[test]
    fn diff_classification() {
        let json = serde_json::json!({
            "diffs": [
                { "old_path": "a.md", "new_path": "a.md", "new_file": true },
                { "old_path": "b.md", "new_path": "b.md", "deleted_file": true },
                { "old_path": "c.md", "new_path": "d.md", "renamed_file": true },
                { "old_path": "e.md", "new_path": "e.md" }
            ]
        });
        let resp: CompareResponse = serde_json::from_value(json).unwrap();
        assert_eq!(resp.diffs.len(), 4);
        assert!(resp.diffs[2].renamed_file);
        assert!(!resp.diffs[3].new_file);
    }
}
