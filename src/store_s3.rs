//! S3-compatible index store.
//!
//! Uses the same two-artifact layout as the filesystem store, with objects
//! instead of files:
//!
//! ```text
//! s3://{bucket}/{prefix}{sanitized key}/state.json
//! s3://{bucket}/{prefix}{sanitized key}/search.json
//! ```
//!
//! Requests go straight to the S3 REST API. When credentials are available
//! they are signed with
//! [AWS Signature Version 4](https://docs.aws.amazon.com/AmazonS3/latest/API/sigv4-auth-using-authorization-header.html)
//! using the pure-Rust `hmac` + `sha2` crates; without credentials requests
//! are sent unsigned, which works for public buckets.
//!
//! # Configuration
//!
//! ```toml
//! [store.remote]
//! bucket = "acme-indexes"
//! prefix = "context-sync/indexes/"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! # force_path_style = true
//! ```
//!
//! # Write ordering
//!
//! `search.json` is written before `state.json`, and `state.json` is
//! deleted before `search.json`. A key is only considered present once its
//! full state exists, so a crash mid-save leaves the previous pair (or no
//! pair) visible to incremental indexing.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use context_sync_core::models::{IndexState, IndexStateSearchOnly};
use context_sync_core::store::{
    ensure_manifest, sanitize_key, IndexStore, IndexStoreReader, ROOT_KEY, SEARCH_FILE,
    STATE_FILE,
};
use context_sync_core::SyncError;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::config::{AwsCredentials, ObjectStoreConfig};

type HmacSha256 = Hmac<Sha256>;

/// Index store backed by an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    config: ObjectStoreConfig,
    creds: Option<AwsCredentials>,
    client: reqwest::Client,
}

impl ObjectStore {
    pub fn new(config: ObjectStoreConfig, creds: Option<AwsCredentials>) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            bail!(SyncError::config("object store bucket must not be empty"));
        }
        let mut config = config;
        if !config.prefix.is_empty() && !config.prefix.ends_with('/') {
            config.prefix.push('/');
        }
        Ok(Self {
            config,
            creds,
            client: reqwest::Client::new(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Object key of `file` for index `key`.
    fn object_key(&self, key: &str, file: &str) -> Result<String> {
        let sanitized = sanitize_key(key);
        if sanitized.is_empty() {
            bail!(SyncError::config(format!(
                "index key '{}' is empty after sanitization",
                key
            )));
        }
        if sanitized == ROOT_KEY {
            return Ok(format!("{}{}", self.config.prefix, file));
        }
        Ok(format!("{}{}/{}", self.config.prefix, sanitized, file))
    }

    fn describe(&self, object_key: &str) -> String {
        format!("s3://{}/{}", self.config.bucket, object_key)
    }

    /// Scheme, host, and path prefix for requests to this bucket.
    fn endpoint(&self) -> (String, String, String) {
        let bucket = &self.config.bucket;
        match &self.config.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                if self.config.force_path_style {
                    (scheme.to_string(), host, format!("/{}", bucket))
                } else {
                    (scheme.to_string(), format!("{}.{}", bucket, host), String::new())
                }
            }
            None => {
                let host = format!("s3.{}.amazonaws.com", self.config.region);
                if self.config.force_path_style {
                    ("https".to_string(), host, format!("/{}", bucket))
                } else {
                    ("https".to_string(), format!("{}.{}", bucket, host), String::new())
                }
            }
        }
    }

    /// Send a (signed, when credentials exist) request for `object_key`,
    /// or for the bucket itself when `object_key` is `None`.
    async fn send(
        &self,
        method: Method,
        object_key: Option<&str>,
        query: &[(&str, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let (scheme, host, base_path) = self.endpoint();
        let canonical_uri = match object_key {
            Some(key) => format!(
                "{}/{}",
                base_path,
                key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
            ),
            None => format!("{}/", base_path),
        };

        let mut sorted_params: Vec<(&str, &String)> = query.iter().map(|(k, v)| (*k, v)).collect();
        sorted_params.sort_by(|a, b| a.0.cmp(b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let url = if canonical_querystring.is_empty() {
            format!("{}://{}{}", scheme, host, canonical_uri)
        } else {
            format!("{}://{}{}?{}", scheme, host, canonical_uri, canonical_querystring)
        };

        let mut req = self.client.request(method.clone(), &url);

        if let Some(creds) = &self.creds {
            let now = Utc::now();
            let date_stamp = now.format("%Y%m%d").to_string();
            let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
            let payload_hash = hex_sha256(&body);

            let mut headers = vec![
                ("host".to_string(), host.clone()),
                ("x-amz-content-sha256".to_string(), payload_hash.clone()),
                ("x-amz-date".to_string(), amz_date.clone()),
            ];
            if let Some(token) = &creds.session_token {
                headers.push(("x-amz-security-token".to_string(), token.clone()));
            }
            headers.sort_by(|a, b| a.0.cmp(&b.0));

            let signed_headers: String = headers
                .iter()
                .map(|(k, _)| k.as_str())
                .collect::<Vec<_>>()
                .join(";");
            let canonical_headers: String = headers
                .iter()
                .map(|(k, v)| format!("{}:{}\n", k, v))
                .collect();

            let canonical_request = format!(
                "{}\n{}\n{}\n{}\n{}\n{}",
                method.as_str(),
                canonical_uri,
                canonical_querystring,
                canonical_headers,
                signed_headers,
                payload_hash
            );

            let region = &self.config.region;
            let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
            let string_to_sign = format!(
                "AWS4-HMAC-SHA256\n{}\n{}\n{}",
                amz_date,
                credential_scope,
                hex_sha256(canonical_request.as_bytes())
            );
            let signing_key =
                derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3")?;
            let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

            let authorization = format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                creds.access_key_id, credential_scope, signed_headers, signature
            );

            req = req
                .header("Authorization", authorization)
                .header("x-amz-content-sha256", payload_hash)
                .header("x-amz-date", amz_date);
            if let Some(token) = &creds.session_token {
                req = req.header("x-amz-security-token", token);
            }
        }

        if !body.is_empty() {
            req = req.header("Content-Type", "application/json").body(body);
        }

        req.send()
            .await
            .map_err(|e| anyhow!("S3 {} {} failed: {}", method, url, e))
    }

    async fn get_json<T: DeserializeOwned>(&self, object_key: &str) -> Result<Option<T>> {
        let resp = self.send(Method::GET, Some(object_key), &[], Vec::new()).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if body.contains("<Code>NoSuchKey</Code>") {
                return Ok(None);
            }
            bail!(
                "S3 GetObject failed (HTTP {}) for {}: {}",
                status,
                self.describe(object_key),
                body.chars().take(500).collect::<String>()
            );
        }
        let bytes = resp.bytes().await?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", self.describe(object_key)))?;
        Ok(Some(value))
    }

    async fn put_json<T: serde::Serialize>(&self, object_key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        let resp = self.send(Method::PUT, Some(object_key), &[], body).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for {}: {}",
                status,
                self.describe(object_key),
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(())
    }

    /// `HEAD` an object; 404 means absent.
    async fn object_exists(&self, object_key: &str) -> Result<bool> {
        let resp = self
            .send(Method::HEAD, Some(object_key), &[], Vec::new())
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        bail!(
            "S3 HeadObject failed (HTTP {}) for {}",
            status,
            self.describe(object_key)
        );
    }

    async fn delete_object(&self, object_key: &str) -> Result<()> {
        let resp = self
            .send(Method::DELETE, Some(object_key), &[], Vec::new())
            .await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        bail!(
            "S3 DeleteObject failed (HTTP {}) for {}",
            status,
            self.describe(object_key)
        );
    }
}

#[async_trait]
impl IndexStoreReader for ObjectStore {
    async fn load_state(&self, key: &str) -> Result<Option<IndexState>> {
        let state: Option<IndexState> = self.get_json(&self.object_key(key, STATE_FILE)?).await?;
        if let Some(state) = &state {
            ensure_manifest(key, state)?;
        }
        Ok(state)
    }

    async fn load_search(&self, key: &str) -> Result<Option<IndexStateSearchOnly>> {
        self.get_json(&self.object_key(key, SEARCH_FILE)?).await
    }

    /// Immediate "directories" under the prefix, via `ListObjectsV2` with a
    /// `/` delimiter, following `NextContinuationToken` across pages.
    ///
    /// Each candidate is then checked for its `state.json`: a key with only
    /// `search.json` (a save in flight, or one that crashed) is not listed.
    async fn list(&self) -> Result<Vec<String>> {
        let mut candidates = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type", "2".to_string()),
                ("delimiter", "/".to_string()),
                ("max-keys", "1000".to_string()),
            ];
            if !self.config.prefix.is_empty() {
                query.push(("prefix", self.config.prefix.clone()));
            }
            if let Some(token) = &continuation_token {
                query.push(("continuation-token", token.clone()));
            }

            let resp = self.send(Method::GET, None, &query, Vec::new()).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}) for s3://{}/{}: {}",
                    status,
                    self.config.bucket,
                    self.config.prefix,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml = resp.text().await?;
            let page = parse_list_response(&xml);
            candidates.extend(page.prefixes.into_iter().filter_map(|p| {
                let name = p.strip_prefix(&self.config.prefix)?.trim_end_matches('/');
                (!name.is_empty()).then(|| name.to_string())
            }));

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        candidates.sort();
        candidates.dedup();
        let mut keys = Vec::with_capacity(candidates.len());
        for name in candidates {
            let state_key = format!("{}{}/{}", self.config.prefix, name, STATE_FILE);
            if self.object_exists(&state_key).await? {
                keys.push(name);
            } else {
                tracing::debug!(key = %name, "skipping prefix without full state");
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl IndexStore for ObjectStore {
    async fn save(
        &self,
        key: &str,
        full: &IndexState,
        search: &IndexStateSearchOnly,
    ) -> Result<()> {
        let search_key = self.object_key(key, SEARCH_FILE)?;
        let state_key = self.object_key(key, STATE_FILE)?;
        self.put_json(&search_key, search).await?;
        self.put_json(&state_key, full).await?;
        tracing::debug!(key, object = %self.describe(&state_key), "saved index state");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let sanitized = sanitize_key(key);
        if sanitized == ROOT_KEY {
            bail!(SyncError::config(format!(
                "refusing to delete the store prefix s3://{}/{}",
                self.config.bucket, self.config.prefix
            )));
        }
        self.delete_object(&self.object_key(key, STATE_FILE)?).await?;
        self.delete_object(&self.object_key(key, SEARCH_FILE)?).await?;
        Ok(())
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~` as is.
pub(crate) fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing ============

struct ListPage {
    prefixes: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

/// Pull `<CommonPrefixes><Prefix>` entries and pagination markers out of a
/// `ListObjectsV2` response.
fn parse_list_response(xml: &str) -> ListPage {
    let mut prefixes = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<CommonPrefixes>") {
        let block_start = start + "<CommonPrefixes>".len();
        let Some(end) = remaining[block_start..].find("</CommonPrefixes>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(prefix) = extract_xml_value(block, "Prefix") {
            prefixes.push(prefix);
        }
        remaining = &remaining[block_start + end + "</CommonPrefixes>".len()..];
    }

    ListPage {
        prefixes,
        is_truncated: extract_xml_value(xml, "IsTruncated").is_some_and(|v| v == "true"),
        next_token: extract_xml_value(xml, "NextContinuationToken"),
    }
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: Option<&str>, path_style: bool) -> ObjectStore {
        let mut config = ObjectStoreConfig::new("acme", "context-sync");
        config.endpoint_url = endpoint.map(str::to_string);
        config.force_path_style = path_style;
        ObjectStore::new(config, None).unwrap()
    }

    #[test]
    fn signing_key_matches_aws_reference() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn uri_encode_reserved() {
        assert_eq!(uri_encode("a b/c~d"), "a%20b%2Fc~d");
        assert_eq!(uri_encode("key=value&x"), "key%3Dvalue%26x");
    }

    #[test]
    fn prefix_gets_trailing_slash_and_keys_are_sanitized() {
        let s = store(None, false);
        assert_eq!(s.prefix(), "context-sync/");
        assert_eq!(
            s.object_key("acme/widgets", STATE_FILE).unwrap(),
            "context-sync/acme_widgets/state.json"
        );
        assert!(s.object_key("..", STATE_FILE).is_err());
    }

    #[test]
    fn endpoint_styles() {
        assert_eq!(
            store(None, false).endpoint(),
            (
                "https".to_string(),
                "acme.s3.us-east-1.amazonaws.com".to_string(),
                String::new()
            )
        );
        assert_eq!(
            store(Some("http://localhost:9000/"), true).endpoint(),
            (
                "http".to_string(),
                "localhost:9000".to_string(),
                "/acme".to_string()
            )
        );
        assert_eq!(
            store(Some("https://r2.example.com"), false).endpoint().1,
            "acme.r2.example.com"
        );
    }

    #[test]
    fn parses_common_prefixes_and_pagination() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>acme</Name>
  <Prefix>context-sync/indexes/</Prefix>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok-2</NextContinuationToken>
  <CommonPrefixes><Prefix>context-sync/indexes/docs/</Prefix></CommonPrefixes>
  <CommonPrefixes><Prefix>context-sync/indexes/widgets/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let page = parse_list_response(xml);
        assert_eq!(
            page.prefixes,
            vec!["context-sync/indexes/docs/", "context-sync/indexes/widgets/"]
        );
        assert!(page.is_truncated);
        assert_eq!(page.next_token.as_deref(), Some("tok-2"));
    }

    #[test]
    fn empty_bucket_rejected() {
        assert!(ObjectStore::new(ObjectStoreConfig::new("  ", ""), None).is_err());
    }
}
