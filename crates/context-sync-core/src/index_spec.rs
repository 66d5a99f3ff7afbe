//! Index references and the flat display-name namespace built from them.
//!
//! # Grammar
//!
//! | Form | Kind | Display name |
//! |------|------|--------------|
//! | `proj` | [`IndexSpecKind::Name`] | `proj` |
//! | `path:/data/indexes/proj` | [`IndexSpecKind::Path`] | `proj` |
//! | `s3://bucket/team/proj` | [`IndexSpecKind::RemoteUrl`] | `proj` |
//!
//! When two specs produce the same display name, later ones get `-2`,
//! `-3`, ... appended.

use anyhow::{bail, Result};
use std::collections::HashSet;

use crate::error::SyncError;

const PATH_PREFIX: &str = "path:";
const S3_SCHEME: &str = "s3://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSpecKind {
    /// Named index in the default store.
    Name,
    /// Index directory on the local filesystem.
    Path,
    /// Index in an S3-compatible bucket.
    RemoteUrl,
}

/// A parsed reference to one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub kind: IndexSpecKind,
    /// Name, filesystem path, or URL, without the `path:` prefix.
    pub value: String,
    pub display_name: String,
}

/// Bucket location of a remote index, parsed from an `s3://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub bucket: String,
    /// Prefix that holds the index directory, empty or ending in `/`.
    pub prefix: String,
    /// Final path segment; the key within `prefix`.
    pub key: String,
}

impl IndexSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!(SyncError::config("index spec must not be empty"));
        }

        if let Some(path) = raw.strip_prefix(PATH_PREFIX) {
            let display_name = last_segment(path).ok_or_else(|| {
                SyncError::config(format!("index path has no final component: '{}'", raw))
            })?;
            return Ok(Self {
                kind: IndexSpecKind::Path,
                value: path.to_string(),
                display_name,
            });
        }

        if raw.starts_with(S3_SCHEME) {
            let location = RemoteLocation::parse(raw)?;
            return Ok(Self {
                kind: IndexSpecKind::RemoteUrl,
                value: raw.to_string(),
                display_name: location.key,
            });
        }

        if raw.contains("://") {
            bail!(SyncError::config(format!(
                "unsupported index URL '{}': only s3:// is supported",
                raw
            )));
        }
        if raw.contains(char::is_whitespace) || raw.contains('/') {
            bail!(SyncError::config(format!(
                "invalid index name '{}' (use path: for filesystem locations)",
                raw
            )));
        }

        Ok(Self {
            kind: IndexSpecKind::Name,
            value: raw.to_string(),
            display_name: raw.to_string(),
        })
    }

    /// Parse a list of specs and make their display names unique.
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Self>> {
        let mut specs = raw
            .iter()
            .map(|s| Self::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        assign_display_names(&mut specs);
        Ok(specs)
    }
}

impl RemoteLocation {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(S3_SCHEME)
            .ok_or_else(|| SyncError::config(format!("not an s3:// URL: '{}'", url)))?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            bail!(SyncError::config(format!(
                "s3 URL must name a bucket and an index: '{}'",
                url
            )));
        }

        let bucket = segments[0].to_string();
        let key = segments[segments.len() - 1].to_string();
        let middle = &segments[1..segments.len() - 1];
        let prefix = if middle.is_empty() {
            String::new()
        } else {
            format!("{}/", middle.join("/"))
        };

        Ok(Self {
            bucket,
            prefix,
            key,
        })
    }
}

/// Disambiguate display names in place: the first occurrence keeps its
/// name, later duplicates become `name-2`, `name-3`, ...
pub fn assign_display_names(specs: &mut [IndexSpec]) {
    let mut taken: HashSet<String> = HashSet::new();
    for spec in specs.iter_mut() {
        let base = spec.display_name.clone();
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        taken.insert(candidate.clone());
        spec.display_name = candidate;
    }
}

fn last_segment(path: &str) -> Option<String> {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .last()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(specs: &[IndexSpec]) -> Vec<&str> {
        specs.iter().map(|s| s.display_name.as_str()).collect()
    }

    #[test]
    fn parses_each_kind() {
        let specs = IndexSpec::parse_all(&["proj", "path:/tmp/x", "s3://bucket/a/b/idx"]).unwrap();
        assert_eq!(names(&specs), vec!["proj", "x", "idx"]);
        assert_eq!(specs[0].kind, IndexSpecKind::Name);
        assert_eq!(specs[1].kind, IndexSpecKind::Path);
        assert_eq!(specs[1].value, "/tmp/x");
        assert_eq!(specs[2].kind, IndexSpecKind::RemoteUrl);
    }

    #[test]
    fn duplicates_get_suffixes() {
        let specs =
            IndexSpec::parse_all(&["path:/a/project", "path:/b/project", "path:/c/project/"])
                .unwrap();
        assert_eq!(names(&specs), vec!["project", "project-2", "project-3"]);
    }

    #[test]
    fn suffix_skips_names_already_taken() {
        let specs = IndexSpec::parse_all(&["project-2", "path:/a/project", "path:/b/project"])
            .unwrap();
        assert_eq!(names(&specs), vec!["project-2", "project", "project-3"]);
    }

    #[test]
    fn remote_location_splits_prefix_and_key() {
        let loc = RemoteLocation::parse("s3://bucket/a/b/idx").unwrap();
        assert_eq!(loc.bucket, "bucket");
        assert_eq!(loc.prefix, "a/b/");
        assert_eq!(loc.key, "idx");

        let loc = RemoteLocation::parse("s3://bucket/idx/").unwrap();
        assert_eq!(loc.prefix, "");
        assert_eq!(loc.key, "idx");
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(IndexSpec::parse("").is_err());
        assert!(IndexSpec::parse("s3://bucket").is_err());
        assert!(IndexSpec::parse("https://example.com/idx").is_err());
        assert!(IndexSpec::parse("two words").is_err());
        assert!(IndexSpec::parse("path:/").is_err());
    }
}
