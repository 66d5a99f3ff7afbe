use axum::http::{StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ctx_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ctx-sync"))
}

async fn page(uri: Uri) -> Response {
    match uri.path() {
        "/robots.txt" => "User-agent: *\nAllow: /\n".into_response(),
        "/" => Html(
            r#"<html><head><title>Acme Handbook</title></head><body>
            <p>See <a href="/ops/deploy">deploying</a> and <a href="/ops/oncall">on-call</a>.</p>
            </body></html>"#,
        )
        .into_response(),
        "/ops/deploy" => Html(
            r#"<html><head><title>Deploying</title></head><body>
            <h2>Rollout</h2><p>Use the blue/green pipeline.</p></body></html>"#,
        )
        .into_response(),
        "/ops/oncall" => Html(
            r#"<html><head><title>On-call</title></head><body>
            <p>Page the primary first.</p></body></html>"#,
        )
        .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve the test site from a background thread; returns its base URL.
fn spawn_site() -> String {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            let app = Router::new().fallback(page);
            axum::serve(listener, app).await.unwrap();
        });
    });
    format!("http://{}/", rx.recv().unwrap())
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let site = spawn_site();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[store]
path = "{}/store"

[website]
delay_ms = 0

[sources.website.handbook]
url = "{}"
maxDepth = 2

[sources.github.widgets]
owner = "acme"
repo = "widgets"
"#,
        root.display(),
        site
    );

    let config_path = config_dir.join("ctx-sync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ctx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ctx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("GITHUB_TOKEN")
        .env_remove("AWS_ACCESS_KEY_ID")
        .env_remove("AWS_SECRET_ACCESS_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ctx-sync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn index_handbook(config_path: &Path) {
    let (stdout, stderr, success) = run_ctx(config_path, &["index", "website:handbook"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_index_website() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ctx(&config_path, &["index", "website:handbook"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("full index of 'handbook': 3 indexed"));

    let dir = tmp.path().join("store").join("indexes").join("handbook");
    assert!(dir.join("state.json").exists());
    assert!(dir.join("search.json").exists());
}

#[test]
fn test_reindex_website_is_full() {
    let (_tmp, config_path) = setup_test_env();
    index_handbook(&config_path);

    let (stdout, _, success) = run_ctx(&config_path, &["index", "website:handbook", "--json"]);
    assert!(success);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["kind"], "full");
    assert_eq!(result["filesIndexed"], 3);
    assert_eq!(result["filesRemoved"], 0);
}

#[test]
fn test_list() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_ctx(&config_path, &["list"]);
    assert!(success);
    assert!(stdout.contains("No indexes found."));

    index_handbook(&config_path);
    let (stdout, _, success) = run_ctx(&config_path, &["list", "--json"]);
    assert!(success);
    let list: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(list[0]["name"], "handbook");
    assert_eq!(list[0]["sourceType"], "website");
}

#[test]
fn test_search() {
    let (_tmp, config_path) = setup_test_env();
    index_handbook(&config_path);

    let (stdout, stderr, success) = run_ctx(&config_path, &["search", "handbook", "deploy"]);
    assert!(success, "search failed: stderr={}", stderr);
    assert!(stdout.contains("ops/deploy.md"));
    assert!(!stdout.contains("ops/oncall.md"));
}

#[test]
fn test_search_unknown_index() {
    let (_tmp, config_path) = setup_test_env();
    index_handbook(&config_path);

    let (_, stderr, success) = run_ctx(&config_path, &["search", "nope", "deploy"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
    assert!(stderr.contains("handbook"));
}

#[test]
fn test_ls_and_cat() {
    let (_tmp, config_path) = setup_test_env();
    index_handbook(&config_path);

    let (stdout, _, success) = run_ctx(&config_path, &["ls", "handbook"]);
    assert!(success);
    assert_eq!(stdout, "index.md\nops/\n");

    let (stdout, _, success) = run_ctx(&config_path, &["ls", "handbook", "ops"]);
    assert!(success);
    assert_eq!(stdout, "ops/deploy.md\nops/oncall.md\n");

    let (stdout, _, success) = run_ctx(&config_path, &["cat", "handbook", "ops/deploy.md"]);
    assert!(success);
    assert_eq!(
        stdout,
        "# Deploying\n\n## Rollout\n\nUse the blue/green pipeline.\n"
    );

    let (_, _, success) = run_ctx(&config_path, &["cat", "handbook", "ops/missing.md"]);
    assert!(!success);
}

#[test]
fn test_path_index_spec() {
    let (tmp, config_path) = setup_test_env();
    index_handbook(&config_path);

    let spec = format!(
        "path:{}",
        tmp.path().join("store").join("indexes").join("handbook").display()
    );
    let (stdout, stderr, success) = run_ctx(&config_path, &["list", "--index", &spec, "--json"]);
    assert!(success, "list failed: stderr={}", stderr);
    let list: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["name"], "handbook");

    let (stdout, _, success) =
        run_ctx(&config_path, &["search", "handbook", "oncall", "--index", &spec]);
    assert!(success);
    assert!(stdout.contains("ops/oncall.md"));
}

#[test]
fn test_delete() {
    let (_tmp, config_path) = setup_test_env();
    index_handbook(&config_path);

    let (stdout, _, success) = run_ctx(&config_path, &["delete", "handbook"]);
    assert!(success);
    assert!(stdout.contains("Deleted"));

    let (stdout, _, _) = run_ctx(&config_path, &["list"]);
    assert!(stdout.contains("No indexes found."));

    let (_, stderr, success) = run_ctx(&config_path, &["delete", ".."]);
    assert!(!success);
    assert!(stderr.contains("empty after sanitization"));
}

#[test]
fn test_github_source_requires_token() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ctx(&config_path, &["index", "github:widgets"]);
    assert!(!success);
    assert!(stderr.contains("GITHUB_TOKEN"));
}

#[test]
fn test_unknown_source() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ctx(&config_path, &["index", "website:missing"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
    assert!(stderr.contains("github:widgets, website:handbook"));

    let (_, stderr, success) = run_ctx(&config_path, &["index", "svn:handbook"]);
    assert!(!success);
    assert!(stderr.contains("unknown source kind"));
}
