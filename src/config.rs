//! TOML configuration parsing and validation.
//!
//! A single [`Config`] value carries everything components need (store
//! locations, filter limits, crawl defaults, named sources). Credentials are
//! read once into [`Credentials`] and passed explicitly to constructors; no
//! component reads the process environment on its own.
//!
//! # Example
//!
//! ```toml
//! [store]
//! path = "~/.context-sync"
//!
//! [store.remote]
//! bucket = "acme-indexes"
//! prefix = "context-sync/indexes/"
//! region = "us-east-1"
//!
//! [filter]
//! max_file_size = 1048576
//!
//! [sources.github.widgets]
//! owner = "acme"
//! repo = "widgets"
//! ref = "main"
//!
//! [sources.website.docs]
//! url = "https://docs.acme.dev"
//! maxPages = 50
//! ```

use anyhow::{bail, Context, Result};
use context_sync_core::filter::DEFAULT_MAX_FILE_SIZE;
use context_sync_core::models::{
    BitBucketSourceConfig, GitHubSourceConfig, GitLabSourceConfig, SourceKind,
    WebsiteSourceConfig,
};
use context_sync_core::SyncError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub website: WebsiteDefaults,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Base directory; indexes live under `{path}/indexes`.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Optional read-only remote layer.
    #[serde(default)]
    pub remote: Option<ObjectStoreConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            remote: None,
        }
    }
}

impl StoreConfig {
    /// Directory holding one subdirectory per index key.
    pub fn indexes_dir(&self) -> PathBuf {
        expand_tilde(&self.path).join("indexes")
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("~/.context-sync")
}

/// S3-compatible bucket holding indexes.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for MinIO, LocalStack, R2, ...
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Address the bucket as `{endpoint}/{bucket}` instead of a subdomain.
    #[serde(default)]
    pub force_path_style: bool,
}

impl ObjectStoreConfig {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

fn default_prefix() -> String {
    "context-sync/indexes/".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

fn default_max_file_size() -> usize {
    DEFAULT_MAX_FILE_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_engine_provider")]
    pub provider: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: default_engine_provider(),
        }
    }
}

fn default_engine_provider() -> String {
    "local".to_string()
}

/// Crawl settings applied when a website source leaves them unset.
#[derive(Debug, Deserialize, Clone)]
pub struct WebsiteDefaults {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_respect_robots")]
    pub respect_robots_txt: bool,
}

impl Default for WebsiteDefaults {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_pages: default_max_pages(),
            delay_ms: default_delay_ms(),
            user_agent: default_user_agent(),
            respect_robots_txt: default_respect_robots(),
        }
    }
}

fn default_max_depth() -> usize {
    3
}
fn default_max_pages() -> usize {
    100
}
fn default_delay_ms() -> u64 {
    100
}
fn default_user_agent() -> String {
    format!("context-sync/{}", env!("CARGO_PKG_VERSION"))
}
fn default_respect_robots() -> bool {
    true
}

/// Named source definitions: `[sources.<kind>.<name>]`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub github: BTreeMap<String, GitHubSourceConfig>,
    #[serde(default)]
    pub gitlab: BTreeMap<String, GitLabSourceConfig>,
    #[serde(default)]
    pub bitbucket: BTreeMap<String, BitBucketSourceConfig>,
    #[serde(default)]
    pub website: BTreeMap<String, WebsiteSourceConfig>,
}

/// A named source resolved from the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    Github(GitHubSourceConfig),
    Gitlab(GitLabSourceConfig),
    Bitbucket(BitBucketSourceConfig),
    Website(WebsiteSourceConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::Github(_) => SourceKind::Github,
            SourceConfig::Gitlab(_) => SourceKind::Gitlab,
            SourceConfig::Bitbucket(_) => SourceKind::Bitbucket,
            SourceConfig::Website(_) => SourceKind::Website,
        }
    }
}

impl Config {
    /// Config with every section at its default.
    pub fn minimal() -> Self {
        Self {
            store: StoreConfig::default(),
            filter: FilterConfig::default(),
            engine: EngineConfig::default(),
            website: WebsiteDefaults::default(),
            sources: SourcesConfig::default(),
        }
    }

    /// Look up a source by `<kind>:<name>`.
    pub fn source(&self, spec: &str) -> Result<SourceConfig> {
        let (kind, name) = spec.split_once(':').ok_or_else(|| {
            SyncError::config(format!(
                "source must be '<kind>:<name>' (e.g. github:widgets), got '{}'",
                spec
            ))
        })?;
        let found = match kind {
            "github" => self.sources.github.get(name).cloned().map(SourceConfig::Github),
            "gitlab" => self.sources.gitlab.get(name).cloned().map(SourceConfig::Gitlab),
            "bitbucket" => self
                .sources
                .bitbucket
                .get(name)
                .cloned()
                .map(SourceConfig::Bitbucket),
            "website" => self
                .sources
                .website
                .get(name)
                .cloned()
                .map(SourceConfig::Website),
            other => bail!(SyncError::config(format!(
                "unknown source kind '{}'. Must be github, gitlab, bitbucket, or website.",
                other
            ))),
        };
        found.ok_or_else(|| {
            let labels = self.source_labels();
            let configured = if labels.is_empty() {
                "none".to_string()
            } else {
                labels.join(", ")
            };
            SyncError::not_found(format!(
                "source '{}' in config (configured: {})",
                spec, configured
            ))
            .into()
        })
    }

    /// All configured sources as `<kind>:<name>` labels.
    pub fn source_labels(&self) -> Vec<String> {
        let s = &self.sources;
        s.github
            .keys()
            .map(|n| format!("github:{}", n))
            .chain(s.gitlab.keys().map(|n| format!("gitlab:{}", n)))
            .chain(s.bitbucket.keys().map(|n| format!("bitbucket:{}", n)))
            .chain(s.website.keys().map(|n| format!("website:{}", n)))
            .collect()
    }
}

/// Credentials for remote services, read once at startup.
#[derive(Clone, Default)]
pub struct Credentials {
    pub github_token: Option<String>,
    pub gitlab_token: Option<String>,
    pub bitbucket_token: Option<String>,
    pub aws: Option<AwsCredentials>,
}

/// AWS-style access keys for signing S3 requests.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("github_token", &self.github_token.as_ref().map(|_| "***"))
            .field("gitlab_token", &self.gitlab_token.as_ref().map(|_| "***"))
            .field("bitbucket_token", &self.bitbucket_token.as_ref().map(|_| "***"))
            .field("aws", &self.aws.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    /// Read `GITHUB_TOKEN`, `GITLAB_TOKEN`, `BITBUCKET_TOKEN`, and
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
    ///
    /// Missing variables are left unset; each component decides whether it
    /// can run without them.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let aws = match (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Some(AwsCredentials {
                access_key_id,
                secret_access_key,
                session_token: var("AWS_SESSION_TOKEN"),
            }),
            _ => None,
        };
        Self {
            github_token: var("GITHUB_TOKEN"),
            gitlab_token: var("GITLAB_TOKEN"),
            bitbucket_token: var("BITBUCKET_TOKEN"),
            aws,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.filter.max_file_size == 0 {
        bail!(SyncError::config("filter.max_file_size must be > 0"));
    }

    match config.engine.provider.as_str() {
        "local" => {}
        other => bail!(SyncError::config(format!(
            "Unknown engine provider: '{}'. Must be local.",
            other
        ))),
    }

    if let Some(remote) = &config.store.remote {
        if remote.bucket.trim().is_empty() {
            bail!(SyncError::config("store.remote.bucket must not be empty"));
        }
        if !remote.prefix.is_empty() && !remote.prefix.ends_with('/') {
            bail!(SyncError::config("store.remote.prefix must end with '/'"));
        }
    }

    if config.website.max_pages == 0 {
        bail!(SyncError::config("website.max_pages must be >= 1"));
    }

    for (name, site) in &config.sources.website {
        if !site.url.starts_with("http://") && !site.url.starts_with("https://") {
            bail!(SyncError::config(format!(
                "sources.website.{}.url must start with http:// or https://",
                name
            )));
        }
    }

    Ok(())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.filter.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(config.engine.provider, "local");
        assert_eq!(config.website.max_depth, 3);
        assert_eq!(config.website.max_pages, 100);
        assert!(config.store.remote.is_none());
        assert!(config.store.indexes_dir().ends_with("indexes"));
    }

    #[test]
    fn parses_sources_and_remote() {
        let config = parse(
            r#"
[store]
path = "/var/lib/ctx"

[store.remote]
bucket = "acme"
endpoint_url = "http://localhost:9000"
force_path_style = true

[sources.github.widgets]
owner = "acme"
repo = "widgets"
ref = "main"

[sources.gitlab.infra]
projectId = "acme/infra"
baseUrl = "https://gitlab.acme.dev"

[sources.website.docs]
url = "https://docs.acme.dev"
maxPages = 20
excludePaths = ["/blog/**"]
"#,
        )
        .unwrap();

        assert_eq!(config.store.indexes_dir(), PathBuf::from("/var/lib/ctx/indexes"));
        let remote = config.store.remote.as_ref().unwrap();
        assert_eq!(remote.prefix, "context-sync/indexes/");
        assert_eq!(remote.region, "us-east-1");
        assert!(remote.force_path_style);

        match config.source("github:widgets").unwrap() {
            SourceConfig::Github(gh) => {
                assert_eq!(gh.owner, "acme");
                assert_eq!(gh.git_ref.as_deref(), Some("main"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match config.source("website:docs").unwrap() {
            SourceConfig::Website(w) => {
                assert_eq!(w.max_pages, Some(20));
                assert_eq!(w.exclude_paths, vec!["/blog/**"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            config.source_labels(),
            vec!["github:widgets", "gitlab:infra", "website:docs"]
        );
        let err = config.source("website:blog").unwrap_err().to_string();
        assert!(err.contains("configured: github:widgets, gitlab:infra, website:docs"));
    }

    #[test]
    fn source_lookup_errors() {
        let config = parse("").unwrap();
        let err = config.source("github:none").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::NotFound(msg)) if msg.contains("configured: none")
        ));
        assert!(config.source("svn:x").is_err());
        assert!(config.source("nocolon").is_err());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse("[filter]\nmax_file_size = 0\n").is_err());
        assert!(parse("[engine]\nprovider = \"quantum\"\n").is_err());
        assert!(parse("[store.remote]\nbucket = \"b\"\nprefix = \"nope\"\n").is_err());
        assert!(parse("[sources.website.x]\nurl = \"ftp://x\"\n").is_err());
    }

    #[test]
    fn expand_tilde_noop_for_absolute() {
        let path = Path::new("/usr/local/bin");
        assert_eq!(expand_tilde(path), path.to_path_buf());
    }
}
