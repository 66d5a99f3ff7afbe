//! Website crawler connector.
//!
//! Crawls breadth-first from a start URL, staying on the same origin, and
//! turns each HTML page into a compact markdown-like document:
//!
//! ~~~text
//! # Page Title
//!
//! ## Heading
//!
//! Paragraph text.
//!
//! - list item
//!
//! ```
//! code block
//! ```
//! ~~~
//!
//! # Crawl rules
//!
//! - Depth is bounded by `maxDepth` (links from the start page are depth 1)
//!   and total pages by `maxPages`.
//! - `robots.txt` is fetched once per instance and its `Disallow` rules for
//!   `*` or our user agent are honoured (best-effort; a missing or broken
//!   file allows everything).
//! - `includePaths` / `excludePaths` globs decide which pages are indexed.
//!   Links on every fetched page are still followed, so an excluded index
//!   page can lead to included content.
//! - Consecutive fetches are separated by `delayMs`.
//!
//! Page URLs map to index paths: `/` → `index.md`, `/guide/` →
//! `guide/index.md`, `/a/b.html` → `a/b.md`, `/a/b` → `a/b.md`.
//!
//! The crawl runs once per instance; listing and reading files reuse its
//! result.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use context_sync_core::filter::FileFilter;
use context_sync_core::models::{
    FileEntry, FileInfo, FileType, SourceMetadata, WebsiteMetadata, WebsiteSourceConfig,
};
use context_sync_core::SyncError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::WebsiteDefaults;

pub struct WebsiteSource {
    config: WebsiteSourceConfig,
    start: Url,
    max_depth: usize,
    max_pages: usize,
    delay: Duration,
    user_agent: String,
    respect_robots: bool,
    include: Option<GlobSet>,
    exclude: GlobSet,
    filter: FileFilter,
    client: reqwest::Client,
    robots: OnceCell<RobotsRules>,
    pages: OnceCell<Vec<FileEntry>>,
}

impl WebsiteSource {
    pub fn new(
        config: WebsiteSourceConfig,
        defaults: &WebsiteDefaults,
        max_file_size: usize,
    ) -> Result<Self> {
        let start = Url::parse(&config.url)
            .map_err(|e| SyncError::config(format!("website source: invalid url '{}': {}", config.url, e)))?;
        if !matches!(start.scheme(), "http" | "https") {
            bail!(SyncError::config(format!(
                "website source: url must be http or https, got '{}'",
                config.url
            )));
        }

        let max_pages = config.max_pages.unwrap_or(defaults.max_pages);
        if max_pages == 0 {
            bail!(SyncError::config("website source: maxPages must be >= 1"));
        }
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| defaults.user_agent.clone());

        let include = if config.include_paths.is_empty() {
            None
        } else {
            Some(build_globset(&config.include_paths)?)
        };
        let exclude = build_globset(&config.exclude_paths)?;

        let client = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            max_depth: config.max_depth.unwrap_or(defaults.max_depth),
            max_pages,
            delay: Duration::from_millis(config.delay_ms.unwrap_or(defaults.delay_ms)),
            respect_robots: config
                .respect_robots_txt
                .unwrap_or(defaults.respect_robots_txt),
            user_agent,
            include,
            exclude,
            filter: FileFilter::new(None, None, max_file_size)?,
            client,
            robots: OnceCell::new(),
            pages: OnceCell::new(),
            start,
            config,
        })
    }

    pub(crate) fn metadata(&self) -> SourceMetadata {
        SourceMetadata::Website(WebsiteMetadata {
            config: self.config.clone(),
            synced_at: Utc::now(),
        })
    }

    pub(crate) async fn fetch_all(&self) -> Result<Vec<FileEntry>> {
        Ok(self.pages().await?.to_vec())
    }

    pub(crate) async fn list_files(&self, directory: &str) -> Result<Vec<FileInfo>> {
        Ok(list_children(self.pages().await?, directory))
    }

    pub(crate) async fn read_file(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .pages()
            .await?
            .iter()
            .find(|f| f.path == path)
            .map(|f| f.contents.clone()))
    }

    async fn pages(&self) -> Result<&Vec<FileEntry>> {
        self.pages.get_or_try_init(|| self.crawl()).await
    }

    async fn robots(&self) -> &RobotsRules {
        self.robots
            .get_or_init(|| async {
                if !self.respect_robots {
                    return RobotsRules::default();
                }
                let Ok(url) = self.start.join("/robots.txt") else {
                    return RobotsRules::default();
                };
                match self.fetch_text(&url).await {
                    Ok(Some((body, _))) => parse_robots(&body, &self.user_agent),
                    Ok(None) => RobotsRules::default(),
                    Err(e) => {
                        tracing::debug!(url = %url, error = %e, "robots.txt unavailable");
                        RobotsRules::default()
                    }
                }
            })
            .await
    }

    /// GET a URL; `None` for non-success statuses. Returns the body and
    /// whether it was served as HTML.
    async fn fetch_text(&self, url: &Url) -> Result<Option<(String, bool)>> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;
        if !resp.status().is_success() {
            tracing::debug!(url = %url, status = %resp.status(), "skipping page");
            return Ok(None);
        }
        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(true);
        Ok(Some((resp.text().await?, is_html)))
    }

    fn should_index(&self, url: &Url) -> bool {
        let path = url.path();
        if self.exclude.is_match(path) {
            return false;
        }
        match &self.include {
            Some(include) => include.is_match(path),
            None => true,
        }
    }

    async fn crawl(&self) -> Result<Vec<FileEntry>> {
        let robots = self.robots().await;
        let mut queue: VecDeque<(Url, usize)> = VecDeque::from([(self.start.clone(), 0)]);
        let mut seen: HashSet<String> = HashSet::from([self.start.to_string()]);
        let mut pages: BTreeMap<String, FileEntry> = BTreeMap::new();
        let mut fetched = 0usize;

        while let Some((url, depth)) = queue.pop_front() {
            if fetched >= self.max_pages {
                break;
            }
            if !robots.allows(&robots_path(&url)) {
                tracing::debug!(url = %url, "disallowed by robots.txt");
                continue;
            }
            if fetched > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let (body, is_html) = match self.fetch_text(&url).await {
                Ok(Some(page)) => page,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "fetch failed");
                    continue;
                }
            };
            fetched += 1;
            if !is_html {
                continue;
            }

            let page = render_page(&body, &url);

            if self.should_index(&url) {
                let path = url_to_path(&url);
                if !pages.contains_key(&path) {
                    if let Some(entry) = self.filter.admit(&path, page.text.into_bytes()) {
                        pages.insert(path, entry);
                    }
                }
            }

            if depth < self.max_depth {
                for link in page.links {
                    if link.origin() != self.start.origin() {
                        continue;
                    }
                    if seen.insert(link.to_string()) {
                        queue.push_back((link, depth + 1));
                    }
                }
            }
        }

        tracing::info!(
            url = %self.start,
            fetched,
            indexed = pages.len(),
            "crawl finished"
        );
        Ok(pages.into_values().collect())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| SyncError::config(format!("invalid path glob '{}': {}", pattern, e)))?,
        );
    }
    Ok(builder.build()?)
}

/// Index path for a page URL.
pub fn url_to_path(url: &Url) -> String {
    let path = url.path().trim_start_matches('/');
    if path.is_empty() || path.ends_with('/') {
        return format!("{}index.md", path);
    }
    for ext in [".html", ".htm"] {
        if let Some(stem) = path.strip_suffix(ext) {
            return format!("{}.md", stem);
        }
    }
    format!("{}.md", path)
}

/// Immediate children of `directory` among crawled pages.
fn list_children(pages: &[FileEntry], directory: &str) -> Vec<FileInfo> {
    let prefix = if directory.is_empty() {
        String::new()
    } else {
        format!("{}/", directory)
    };
    let mut children: BTreeMap<String, FileType> = BTreeMap::new();
    for page in pages {
        let Some(rest) = page.path.strip_prefix(&prefix) else {
            continue;
        };
        match rest.split_once('/') {
            Some((dir, _)) => {
                children.insert(format!("{}{}", prefix, dir), FileType::Directory);
            }
            None => {
                children
                    .entry(page.path.clone())
                    .or_insert(FileType::File);
            }
        }
    }
    children
        .into_iter()
        .map(|(path, file_type)| FileInfo { path, file_type })
        .collect()
}

// ============ HTML rendering ============

struct RenderedPage {
    text: String,
    links: Vec<Url>,
}

const SKIPPED_ANCESTORS: &[&str] = &["nav", "header", "footer", "script", "style", "noscript"];

fn has_ancestor(el: &ElementRef, names: &[&str]) -> bool {
    el.ancestors()
        .filter_map(|n| n.value().as_element())
        .any(|e| names.contains(&e.name()))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

/// Reduce HTML to title, headings, paragraphs, list items, and code, and
/// collect the page's links (fragments stripped).
fn render_page(html: &str, page_url: &Url) -> RenderedPage {
    let document = Html::parse_document(html);
    let sel = |s: &str| Selector::parse(s).ok();

    let title = sel("title")
        .and_then(|s| document.select(&s).next().map(|t| element_text(&t)))
        .filter(|t| !t.is_empty())
        .or_else(|| {
            sel("h1").and_then(|s| document.select(&s).next().map(|t| element_text(&t)))
        })
        .unwrap_or_else(|| page_url.to_string());

    let mut blocks = vec![format!("# {}", title)];
    if let Some(blocks_sel) = sel("h1, h2, h3, h4, h5, h6, p, li, pre") {
        for el in document.select(&blocks_sel) {
            if has_ancestor(&el, SKIPPED_ANCESTORS) || has_ancestor(&el, &["pre"]) {
                continue;
            }
            let name = el.value().name();
            let block = match name {
                "pre" => {
                    let code: String = el.text().collect();
                    let code = code.trim_matches('\n');
                    if code.trim().is_empty() {
                        continue;
                    }
                    format!("```\n{}\n```", code)
                }
                "p" if has_ancestor(&el, &["li"]) => continue,
                _ => {
                    let text = element_text(&el);
                    if text.is_empty() {
                        continue;
                    }
                    match name {
                        "li" => format!("- {}", text),
                        "p" => text,
                        heading => {
                            let level = heading[1..].parse::<usize>().unwrap_or(1);
                            format!("{} {}", "#".repeat(level), text)
                        }
                    }
                }
            };
            blocks.push(block);
        }
    }

    let mut links = Vec::new();
    if let Some(a) = sel("a[href]") {
        for el in document.select(&a) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            let Ok(mut link) = page_url.join(href.trim()) else {
                continue;
            };
            if !matches!(link.scheme(), "http" | "https") {
                continue;
            }
            link.set_fragment(None);
            links.push(link);
        }
    }

    RenderedPage {
        text: blocks.join("\n\n") + "\n",
        links,
    }
}

// ============ robots.txt ============

#[derive(Debug, Default)]
struct RobotsRules {
    allow: Vec<String>,
    disallow: Vec<String>,
}

impl RobotsRules {
    /// Longest matching rule wins; `Allow` wins ties.
    fn allows(&self, path: &str) -> bool {
        let longest = |rules: &[String]| {
            rules
                .iter()
                .filter(|r| rule_matches(r, path))
                .map(|r| r.len())
                .max()
        };
        match (longest(&self.allow), longest(&self.disallow)) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(d)) => a >= d,
        }
    }
}

fn robots_path(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Parse the groups that apply to `user_agent`, falling back to `*`.
fn parse_robots(body: &str, user_agent: &str) -> RobotsRules {
    let token = user_agent
        .split('/')
        .next()
        .unwrap_or(user_agent)
        .trim()
        .to_lowercase();

    let mut specific = RobotsRules::default();
    let mut wildcard = RobotsRules::default();
    let mut matched_specific = false;

    let mut agents: Vec<String> = Vec::new();
    let mut in_rules = false;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_lowercase();
        let value = value.trim();

        if field == "user-agent" {
            if in_rules {
                agents.clear();
                in_rules = false;
            }
            agents.push(value.to_lowercase());
            continue;
        }
        if field != "allow" && field != "disallow" {
            continue;
        }
        in_rules = true;
        if value.is_empty() {
            continue;
        }

        let is_specific = !token.is_empty() && agents.iter().any(|a| a != "*" && token.contains(a.as_str()));
        let target = if is_specific {
            matched_specific = true;
            &mut specific
        } else if agents.iter().any(|a| a == "*") {
            &mut wildcard
        } else {
            continue;
        };
        if field == "allow" {
            target.allow.push(value.to_string());
        } else {
            target.disallow.push(value.to_string());
        }
    }

    if matched_specific {
        specific
    } else {
        wildcard
    }
}

/// Match a robots rule (with `*` wildcards and optional `$` anchor)
/// against a path.
fn rule_matches(rule: &str, path: &str) -> bool {
    let (rule, anchored) = match rule.strip_suffix('$') {
        Some(r) => (r, true),
        None => (rule, false),
    };
    let parts: Vec<&str> = rule.split('*').collect();
    let Some(first) = parts.first() else {
        return true;
    };
    if !path.starts_with(first) {
        return false;
    }
    let mut pos = first.len();
    for part in &parts[1..] {
        match path[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    if anchored {
        let last = parts.last().copied().unwrap_or("");
        return pos == path.len() || (parts.len() > 1 && path.ends_with(last));
    }
    true
}
