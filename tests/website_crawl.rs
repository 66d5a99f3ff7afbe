//! Website crawler tests against a small local site.

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use context_sync::config::{Credentials, SourceConfig, WebsiteDefaults};
use context_sync::source::{Source, SourceOptions};
use context_sync_core::models::{FileType, SourceKind, WebsiteSourceConfig};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Site {
    requests: Mutex<Vec<String>>,
}

impl Site {
    fn hits(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }
}

const HOME: &str = r#"<html><head><title>Acme Docs</title></head><body>
<nav><a href="/">Home</a></nav>
<h1>Welcome</h1>
<p>Start with the <a href="/guide/">guide</a>.</p>
<ul>
  <li><a href="/blog/post.html">Release notes</a></li>
  <li><a href="/private/secret">Internal</a></li>
  <li><a href="https://elsewhere.example/page">Elsewhere</a></li>
  <li><a href="/guide/#top">Guide top</a></li>
</ul>
<footer>Copyright Acme</footer>
</body></html>"#;

const GUIDE: &str = r#"<html><head><title>Guide</title></head><body>
<h1>Guide</h1>
<p>Read <a href="install">installation</a> first.</p>
</body></html>"#;

const INSTALL: &str = r#"<html><head><title>Install</title></head><body>
<h2>Requirements</h2>
<p>You need   a recent toolchain.</p>
<pre>cargo install widgets
widgets --version</pre>
<p><a href="/guide/deep/a">Advanced</a></p>
<script>track()</script>
</body></html>"#;

const DEEP: &str = r#"<html><head><title>Deep</title></head><body>
<p>Deep content.</p>
<a href="/guide/deep/b">Deeper</a>
</body></html>"#;

const POST: &str = r#"<html><head><title>Release 1.0</title></head><body>
<p>Widgets 1.0 is out.</p></body></html>"#;

const SECRET: &str = r#"<html><head><title>Secret</title></head><body><p>hidden</p></body></html>"#;

async fn page(State(site): State<Arc<Site>>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    site.requests.lock().unwrap().push(path.clone());
    match path.as_str() {
        "/robots.txt" => "User-agent: *\nDisallow: /private/\n".into_response(),
        "/" => Html(HOME).into_response(),
        "/guide/" => Html(GUIDE).into_response(),
        "/guide/install" => Html(INSTALL).into_response(),
        "/guide/deep/a" | "/guide/deep/b" => Html(DEEP).into_response(),
        "/blog/post.html" => Html(POST).into_response(),
        "/private/secret" => Html(SECRET).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve() -> (Arc<Site>, String) {
    let site = Arc::new(Site::default());
    let app = Router::new().fallback(page).with_state(Arc::clone(&site));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (site, format!("http://{}/", addr))
}

fn source(config: WebsiteSourceConfig) -> Source {
    let options = SourceOptions {
        credentials: Credentials::default(),
        max_file_size: 1024 * 1024,
        website: WebsiteDefaults::default(),
    };
    Source::from_config(&SourceConfig::Website(config), &options).unwrap()
}

fn config(url: &str) -> WebsiteSourceConfig {
    let mut config = WebsiteSourceConfig::new(url);
    config.delay_ms = Some(0);
    config
}

async fn indexed_paths(source: &Source) -> Vec<String> {
    source
        .fetch_all()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect()
}

#[tokio::test]
async fn crawl_honours_robots_depth_and_origin() {
    let (site, url) = serve().await;
    let source = source(config(&url));

    let paths = indexed_paths(&source).await;
    assert_eq!(
        paths,
        vec![
            "blog/post.md",
            "guide/deep/a.md",
            "guide/index.md",
            "guide/install.md",
            "index.md",
        ]
    );
    assert_eq!(site.hits("/private/secret"), 0);
    // Depth 3 page is fetched but its links are not followed.
    assert_eq!(site.hits("/guide/deep/b"), 0);
    // Fragment links collapse onto the page they point at.
    assert_eq!(site.hits("/guide/"), 1);
    assert_eq!(site.hits("/robots.txt"), 1);
}

#[tokio::test]
async fn depth_and_page_limits() {
    let (_site, url) = serve().await;

    let mut shallow = config(&url);
    shallow.max_depth = Some(1);
    assert_eq!(
        indexed_paths(&source(shallow)).await,
        vec!["blog/post.md", "guide/index.md", "index.md"]
    );

    let mut few = config(&url);
    few.max_pages = Some(2);
    assert_eq!(
        indexed_paths(&source(few)).await,
        vec!["guide/index.md", "index.md"]
    );
}

#[tokio::test]
async fn include_exclude_filter_indexing_not_discovery() {
    let (site, url) = serve().await;
    let mut cfg = config(&url);
    cfg.include_paths = vec!["/guide/*".into()];
    cfg.exclude_paths = vec!["/guide/deep/*".into()];

    let paths = indexed_paths(&source(cfg)).await;
    assert_eq!(paths, vec!["guide/index.md", "guide/install.md"]);
    // Excluded pages are still crawled for links.
    assert_eq!(site.hits("/"), 1);
    assert_eq!(site.hits("/guide/deep/a"), 1);
}

#[tokio::test]
async fn robots_can_be_ignored() {
    let (site, url) = serve().await;
    let mut cfg = config(&url);
    cfg.respect_robots_txt = Some(false);

    let paths = indexed_paths(&source(cfg)).await;
    assert!(paths.contains(&"private/secret.md".to_string()));
    assert_eq!(site.hits("/robots.txt"), 0);
}

#[tokio::test]
async fn pages_render_to_text() {
    let (_site, url) = serve().await;
    let source = source(config(&url));

    let install = source.read_file("guide/install.md").await.unwrap().unwrap();
    assert_eq!(
        install,
        "# Install\n\n## Requirements\n\nYou need a recent toolchain.\n\n```\ncargo install widgets\nwidgets --version\n```\n\nAdvanced\n"
    );

    let home = source.read_file("index.md").await.unwrap().unwrap();
    assert!(home.starts_with("# Acme Docs\n\n# Welcome\n"));
    assert!(!home.contains("Copyright"));
    assert!(!home.contains("Home"));
}

#[tokio::test]
async fn listing_and_reads_reuse_one_crawl() {
    let (site, url) = serve().await;
    let source = source(config(&url));

    let root = source.list_files("").await.unwrap();
    let entries: Vec<(&str, FileType)> = root
        .iter()
        .map(|f| (f.path.as_str(), f.file_type))
        .collect();
    assert_eq!(
        entries,
        vec![
            ("blog", FileType::Directory),
            ("guide", FileType::Directory),
            ("index.md", FileType::File),
        ]
    );

    let guide = source.list_files("guide/").await.unwrap();
    let names: Vec<&str> = guide.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(names, vec!["guide/deep", "guide/index.md", "guide/install.md"]);

    assert!(source.read_file("missing.md").await.unwrap().is_none());
    source.fetch_all().await.unwrap();
    assert_eq!(site.hits("/"), 1);
}

#[tokio::test]
async fn websites_never_update_incrementally() {
    let (_site, url) = serve().await;
    let source = source(config(&url));
    let meta = source.get_metadata().await.unwrap();
    assert_eq!(meta.kind(), SourceKind::Website);
    assert_eq!(meta.resolved_ref(), None);
    assert!(source.fetch_changes(&meta).await.unwrap().is_none());
    assert_eq!(source.resolved_ref().await.unwrap(), None);
}

#[test]
fn invalid_urls_are_config_errors() {
    let options = SourceOptions {
        credentials: Credentials::default(),
        max_file_size: 1024,
        website: WebsiteDefaults::default(),
    };
    for url in ["ftp://acme.dev/", "not a url"] {
        let cfg = SourceConfig::Website(WebsiteSourceConfig::new(url));
        let err = Source::from_config(&cfg, &options).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<context_sync_core::SyncError>(),
            Some(context_sync_core::SyncError::Config(_))
        ));
    }
}
