//! Object store tests against a local, path-style mock of the S3 REST API.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use context_sync::config::{AwsCredentials, ObjectStoreConfig};
use context_sync::store_s3::ObjectStore;
use context_sync_core::models::{
    GitHubSourceConfig, IndexState, IndexStateSearchOnly, SourceMetadata, VcsMetadata,
    STATE_VERSION,
};
use context_sync_core::store::{IndexStore, IndexStoreReader};
use context_sync_core::SyncError;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockS3 {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// `METHOD key` for every object request, in arrival order.
    log: Mutex<Vec<String>>,
    authorization: Mutex<Vec<Option<String>>>,
    /// Common prefixes per list page; 0 means unlimited.
    page_size: usize,
}

type Shared = Arc<MockS3>;

fn no_such_key() -> Response {
    (
        StatusCode::NOT_FOUND,
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>NoSuchKey</Code></Error>",
    )
        .into_response()
}

fn record(mock: &MockS3, method: &Method, key: &str, headers: &HeaderMap) {
    mock.log.lock().unwrap().push(format!("{} {}", method, key));
    mock.authorization.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
}

async fn object_handler(
    State(mock): State<Shared>,
    Path((_bucket, key)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&mock, &method, &key, &headers);
    let mut objects = mock.objects.lock().unwrap();
    match method {
        Method::GET | Method::HEAD => match objects.get(&key) {
            Some(bytes) => bytes.clone().into_response(),
            None => no_such_key(),
        },
        Method::PUT => {
            objects.insert(key, body.to_vec());
            StatusCode::OK.into_response()
        }
        Method::DELETE => {
            objects.remove(&key);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn list_handler(
    State(mock): State<Shared>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let delimiter = query.get("delimiter").cloned().unwrap_or_default();
    assert_eq!(query.get("list-type").map(String::as_str), Some("2"));
    assert_eq!(delimiter, "/");

    let objects = mock.objects.lock().unwrap();
    let prefixes: Vec<String> = objects
        .keys()
        .filter_map(|key| {
            let rest = key.strip_prefix(&prefix)?;
            let (dir, _) = rest.split_once('/')?;
            Some(format!("{}{}/", prefix, dir))
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let start: usize = query
        .get("continuation-token")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let end = if mock.page_size == 0 {
        prefixes.len()
    } else {
        (start + mock.page_size).min(prefixes.len())
    };
    let truncated = end < prefixes.len();

    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><ListBucketResult><Name>{}</Name><Prefix>{}</Prefix><IsTruncated>{}</IsTruncated>",
        bucket, prefix, truncated
    );
    for p in &prefixes[start..end] {
        xml.push_str(&format!("<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>", p));
    }
    if truncated {
        xml.push_str(&format!("<NextContinuationToken>{}</NextContinuationToken>", end));
    }
    xml.push_str("</ListBucketResult>");
    xml.into_response()
}

async fn serve(mock: Shared) -> String {
    let app = Router::new()
        .route("/{bucket}/", get(list_handler))
        .route(
            "/{bucket}/{*key}",
            get(object_handler).put(object_handler).delete(object_handler),
        )
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn store(endpoint: &str, creds: Option<AwsCredentials>) -> ObjectStore {
    let mut config = ObjectStoreConfig::new("indexes", "context-sync");
    config.endpoint_url = Some(endpoint.to_string());
    config.force_path_style = true;
    ObjectStore::new(config, creds).unwrap()
}

fn metadata(repo: &str) -> SourceMetadata {
    SourceMetadata::Github(VcsMetadata {
        config: GitHubSourceConfig {
            owner: "acme".into(),
            repo: repo.into(),
            git_ref: None,
            base_url: None,
        },
        resolved_ref: Some("abc123".into()),
        synced_at: Utc::now(),
    })
}

fn pair(repo: &str) -> (IndexState, IndexStateSearchOnly) {
    let full = IndexState {
        version: STATE_VERSION,
        context_state: json!({ "checkpointId": "c1", "blobs": [["b1", "README.md"]] }),
        source: metadata(repo),
    };
    let search = IndexStateSearchOnly {
        version: STATE_VERSION,
        context_state: json!({ "checkpointId": "c1", "addedBlobs": ["b1"] }),
        source: metadata(repo),
    };
    (full, search)
}

#[tokio::test]
async fn save_list_load_round_trip() {
    let mock = Arc::new(MockS3::default());
    let endpoint = serve(Arc::clone(&mock)).await;
    let store = store(&endpoint, None);
    assert_eq!(store.prefix(), "context-sync/");

    for name in ["docs", "api"] {
        let (full, search) = pair(name);
        store.save(name, &full, &search).await.unwrap();
    }

    assert_eq!(store.list().await.unwrap(), vec!["api", "docs"]);
    let state = store.load_state("docs").await.unwrap().unwrap();
    assert_eq!(state.source.identifier(), "acme/docs");
    assert!(state.has_manifest());
    let search = store.load_search("api").await.unwrap().unwrap();
    assert_eq!(search.source.identifier(), "acme/api");

    let log = mock.log.lock().unwrap().clone();
    assert_eq!(
        &log[..2],
        &[
            "PUT context-sync/docs/search.json".to_string(),
            "PUT context-sync/docs/state.json".to_string(),
        ]
    );
    assert!(mock.authorization.lock().unwrap().iter().all(Option::is_none));
}

#[tokio::test]
async fn missing_objects_load_as_none() {
    let mock = Arc::new(MockS3::default());
    let endpoint = serve(Arc::clone(&mock)).await;
    let store = store(&endpoint, None);

    assert!(store.load_state("nope").await.unwrap().is_none());
    assert!(store.load_search("nope").await.unwrap().is_none());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn full_state_without_manifest_is_corrupt() {
    let mock = Arc::new(MockS3::default());
    let endpoint = serve(Arc::clone(&mock)).await;
    let store = store(&endpoint, None);

    let (_, search) = pair("docs");
    let body = serde_json::to_vec(&search).unwrap();
    mock.objects
        .lock()
        .unwrap()
        .insert("context-sync/docs/state.json".into(), body);

    let err = store.load_state("docs").await.err().unwrap();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::CorruptState { key, .. }) if key == "docs"
    ));
}

#[tokio::test]
async fn delete_removes_state_then_search() {
    let mock = Arc::new(MockS3::default());
    let endpoint = serve(Arc::clone(&mock)).await;
    let store = store(&endpoint, None);

    let (full, search) = pair("docs");
    store.save("docs", &full, &search).await.unwrap();
    store.delete("docs").await.unwrap();

    assert!(store.load_state("docs").await.unwrap().is_none());
    assert!(store.list().await.unwrap().is_empty());
    let log = mock.log.lock().unwrap().clone();
    let deletes: Vec<&String> = log.iter().filter(|l| l.starts_with("DELETE")).collect();
    assert_eq!(
        deletes,
        vec![
            "DELETE context-sync/docs/state.json",
            "DELETE context-sync/docs/search.json"
        ]
    );

    // Deleting an absent key is not an error.
    store.delete("docs").await.unwrap();
}

#[tokio::test]
async fn listing_follows_continuation_tokens() {
    let mock = Arc::new(MockS3 {
        page_size: 2,
        ..MockS3::default()
    });
    let endpoint = serve(Arc::clone(&mock)).await;
    let store = store(&endpoint, None);

    for name in ["a", "b", "c", "d", "e"] {
        let (full, search) = pair(name);
        store.save(name, &full, &search).await.unwrap();
    }
    // Objects outside any key directory are not keys.
    mock.objects
        .lock()
        .unwrap()
        .insert("context-sync/README".into(), b"hi".to_vec());

    assert_eq!(store.list().await.unwrap(), vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn listing_skips_keys_without_full_state() {
    let mock = Arc::new(MockS3::default());
    let endpoint = serve(Arc::clone(&mock)).await;
    let store = store(&endpoint, None);

    let (full, search) = pair("docs");
    store.save("docs", &full, &search).await.unwrap();
    // A save that stopped after the search object.
    mock.objects.lock().unwrap().insert(
        "context-sync/partial/search.json".into(),
        serde_json::to_vec(&search).unwrap(),
    );

    assert_eq!(store.list().await.unwrap(), vec!["docs"]);
    assert!(store.load_state("partial").await.unwrap().is_none());
    assert!(mock
        .log
        .lock()
        .unwrap()
        .contains(&"HEAD context-sync/partial/state.json".to_string()));
}

#[tokio::test]
async fn keys_are_sanitized() {
    let mock = Arc::new(MockS3::default());
    let endpoint = serve(Arc::clone(&mock)).await;
    let store = store(&endpoint, None);

    let (full, search) = pair("widgets");
    store.save("acme/widgets@main", &full, &search).await.unwrap();
    assert!(mock
        .objects
        .lock()
        .unwrap()
        .contains_key("context-sync/acme_widgets_main/state.json"));
    assert!(store.load_state("acme/widgets@main").await.unwrap().is_some());
}

#[tokio::test]
async fn requests_are_signed_with_credentials() {
    let mock = Arc::new(MockS3::default());
    let endpoint = serve(Arc::clone(&mock)).await;
    let creds = AwsCredentials {
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
        session_token: None,
    };
    let store = store(&endpoint, Some(creds));

    let (full, search) = pair("docs");
    store.save("docs", &full, &search).await.unwrap();
    store.load_search("docs").await.unwrap().unwrap();

    let auth = mock.authorization.lock().unwrap().clone();
    assert_eq!(auth.len(), 3);
    for header in auth {
        let header = header.expect("signed request");
        assert!(header.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(header.contains("/us-east-1/s3/aws4_request"));
        assert!(header.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }
}
