//! GitHub repository connector.
//!
//! Talks to the GitHub REST API (or a GitHub Enterprise instance via
//! `baseUrl`):
//!
//! | Need | Endpoint |
//! |------|----------|
//! | Resolve ref | `GET /repos/{owner}/{repo}/commits/{ref}` |
//! | Full snapshot | `GET /repos/{owner}/{repo}/zipball/{sha}` |
//! | Delta | `GET /repos/{owner}/{repo}/compare/{base}...{head}` |
//! | Read / list | `GET /repos/{owner}/{repo}/contents/{path}?ref={sha}` |
//!
//! A comparison whose status is `diverged` or `behind` means history was
//! rewritten and the delta is not trusted.
//!
//! # Configuration
//!
//! ```toml
//! [sources.github.widgets]
//! owner = "acme"
//! repo = "widgets"
//! ref = "main"
//! ```
//!
//! Requires `GITHUB_TOKEN`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use context_sync_core::models::{
    FileInfo, FileType, GitHubSourceConfig, SourceMetadata, VcsMetadata,
};
use context_sync_core::SyncError;
use reqwest::{RequestBuilder, Url};
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::source::{
    api_url, extract_archive, get_bytes, get_json, http_client, path_segments, ref_error,
    require_field, require_token, ChangeStatus, ChangedFile, Comparison, VcsBackend,
};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

pub struct GitHubSource {
    config: GitHubSourceConfig,
    base_url: String,
    token: String,
    client: reqwest::Client,
    resolved: OnceCell<String>,
    max_file_size: usize,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
}

#[derive(Deserialize)]
struct CompareResponse {
    status: String,
    #[serde(default)]
    files: Vec<CompareFile>,
}

#[derive(Deserialize)]
struct CompareFile {
    filename: String,
    status: String,
    #[serde(default)]
    previous_filename: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Listing(Vec<ContentEntry>),
    File(ContentFile),
}

#[derive(Deserialize)]
struct ContentEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct ContentFile {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

impl GitHubSource {
    pub fn new(
        config: GitHubSourceConfig,
        token: Option<String>,
        max_file_size: usize,
    ) -> Result<Self> {
        let token = require_token(token, "GITHUB_TOKEN", "GitHub")?;
        require_field("GitHub", "owner", &config.owner)?;
        require_field("GitHub", "repo", &config.repo)?;
        if config.owner.contains('/') || config.repo.contains('/') {
            bail!(SyncError::config(format!(
                "GitHub source: owner and repo must be separate fields, got '{}/{}'",
                config.owner, config.repo
            )));
        }
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

    fn git_ref(&self) -> &str {
        self.config.git_ref.as_deref().unwrap_or("HEAD")
    }

    fn repo_url(&self, tail: &[&str]) -> Result<Url> {
        let mut segments = vec!["repos", self.config.owner.as_str(), self.config.repo.as_str()];
        segments.extend_from_slice(tail);
        api_url(&self.base_url, &segments)
    }

    fn get(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.client
            .get(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn resolve_remote(&self) -> Result<String> {
        let reference = self.git_ref();
        let url = self.repo_url(&["commits", reference])?;
        tracing::debug!(source = %self.label(), reference, "resolving ref");
        match get_json::<CommitResponse>(self.get(url), "GitHub commit lookup").await {
            Ok(Some(commit)) => Ok(commit.sha),
            Ok(None) => Err(ref_error(&self.label(), reference, "no such ref")),
            Err(e) => Err(ref_error(&self.label(), reference, format!("{:#}", e))),
        }
    }

    pub(crate) async fn metadata(&self) -> Result<SourceMetadata> {
        Ok(SourceMetadata::Github(VcsMetadata {
            config: self.config.clone(),
            resolved_ref: Some(self.commit().await?),
            synced_at: Utc::now(),
        }))
    }

    pub(crate) async fn list_dir(&self, commit: &str, directory: &str) -> Result<Vec<FileInfo>> {
        let mut tail = vec!["contents"];
        tail.extend(path_segments(directory));
        let req = self.get(self.repo_url(&tail)?).query(&[("ref", commit)]);
        match get_json::<ContentsResponse>(req, "GitHub contents listing").await? {
            Some(ContentsResponse::Listing(entries)) => {
                let mut files: Vec<FileInfo> = entries
                    .into_iter()
                    .map(|e| FileInfo {
                        path: e.path,
                        file_type: if e.kind == "dir" {
                            FileType::Directory
                        } else {
                            FileType::File
                        },
                    })
                    .collect();
                files.sort_by(|a, b| a.path.cmp(&b.path));
                Ok(files)
            }
            Some(ContentsResponse::File(_)) => {
                bail!("'{}' is a file, not a directory", directory)
            }
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl VcsBackend for GitHubSource {
    fn label(&self) -> String {
        format!("github:{}/{}", self.config.owner, self.config.repo)
    }

    async fn commit(&self) -> Result<String> {
        self.resolved
            .get_or_try_init(|| self.resolve_remote())
            .await
            .cloned()
    }

    async fn compare(&self, base: &str, head: &str) -> Result<Comparison> {
        let range = format!("{}...{}", base, head);
        let url = self.repo_url(&["compare", &range])?;
        let Some(resp) = get_json::<CompareResponse>(self.get(url), "GitHub compare").await? else {
            return Ok(Comparison::Unsafe(format!("commit {} no longer exists", base)));
        };

        match resp.status.as_str() {
            "ahead" | "identical" => {}
            other => return Ok(Comparison::Unsafe(format!("compare status '{}'", other))),
        }

        let files = resp
            .files
            .into_iter()
            .filter_map(|f| {
                let status = match f.status.as_str() {
                    "added" | "copied" => ChangeStatus::Added,
                    "removed" => ChangeStatus::Removed,
                    "renamed" => match f.previous_filename {
                        Some(from) => ChangeStatus::Renamed { from },
                        None => ChangeStatus::Added,
                    },
                    "unchanged" => return None,
                    _ => ChangeStatus::Modified,
                };
                Some(ChangedFile::new(f.filename, status))
            })
            .collect();
        Ok(Comparison::Linear(files))
    }

    async fn download(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let mut tail = vec!["contents"];
        tail.extend(path_segments(path));
        let req = self.get(self.repo_url(&tail)?).query(&[("ref", commit)]);
        let file = match get_json::<ContentsResponse>(req, "GitHub file download").await? {
            Some(ContentsResponse::File(file)) => file,
            Some(ContentsResponse::Listing(_)) | None => return Ok(None),
        };

        match (file.encoding.as_deref(), file.content, file.download_url) {
            (Some("base64"), Some(content), _) => {
                let cleaned: String = content.split_whitespace().collect();
                let bytes = STANDARD
                    .decode(cleaned)
                    .with_context(|| format!("invalid base64 content for '{}'", path))?;
                Ok(Some(bytes))
            }
            // Files over the API's inline limit come back without content.
            (_, _, Some(raw_url)) => get_bytes(self.get(raw_url), "GitHub raw download").await,
            _ => Ok(None),
        }
    }

    async fn snapshot(&self, commit: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let url = self.repo_url(&["zipball", commit])?;
        let bytes = get_bytes(self.get(url), "GitHub archive download")
            .await?
            .ok_or_else(|| SyncError::not_found(format!("archive for {} at {}", self.label(), commit)))?;
        tracing::debug!(source = %self.label(), commit, bytes = bytes.len(), "downloaded archive");
        extract_archive(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GitHubSourceConfig {
        GitHubSourceConfig {
            owner: "acme".into(),
            repo: "widgets".into(),
            git_ref: None,
            base_url: None,
        }
    }

    #[test]
    fn missing_token_is_config_error() {
        let err = GitHubSource::new(config(), None, 1024).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Config(msg)) if msg.contains("GITHUB_TOKEN")
        ));
    }

    #[test]
    fn malformed_identifiers_rejected() {
        let mut bad = config();
        bad.owner = "acme/widgets".into();
        assert!(GitHubSource::new(bad, Some("t".into()), 1024).is_err());

        let mut empty = config();
        empty.repo = " ".into();
        assert!(GitHubSource::new(empty, Some("t".into()), 1024).is_err());
    }

    #[test]
    fn urls_and_default_ref() {
        let source = GitHubSource::new(config(), Some("t".into()), 1024).unwrap();
        assert_eq!(source.git_ref(), "HEAD");
        assert_eq!(
            source.repo_url(&["compare", "a...b"]).unwrap().as_str(),
            "https://api.github.com/repos/acme/widgets/compare/a...b"
        );
    }

    #[tokio::test]
    async fn pinned_source_never_resolves() {
        let mut cfg = config();
        // Unroutable: any network call would fail.
        cfg.base_url = Some("http://127.0.0.1:9".into());
        let source = GitHubSource::new(cfg, Some("t".into()), 1024)
            .unwrap()
            .pinned("deadbeef".into());
        assert_eq!(source.commit().await.unwrap(), "deadbeef");
    }
}
