//! File filter pipeline: decides whether a candidate file belongs in an index.
//!
//! Checks run in a fixed order and the first exclusion wins:
//!
//! | Stage | Check | Reason |
//! |-------|-------|--------|
//! | 1 | `.augmentignore` rules | [`FilterReason::AugmentIgnore`] |
//! | 2 | `..` path segments | [`FilterReason::PathTraversal`] |
//! | 2 | content larger than the size cap | [`FilterReason::TooLarge`] |
//! | 2 | private key / certificate file names | [`FilterReason::Keyish`] |
//! | 2 | content that is not valid UTF-8 | [`FilterReason::Binary`] |
//! | 3 | `.gitignore` rules | [`FilterReason::GitIgnore`] |
//!
//! A negated (`!pattern`) match in `.augmentignore` re-includes a file the
//! `.gitignore` would drop; the structural checks of stage 2 still apply.
//!
//! The filter is pure: it never touches the filesystem. Sources hand it the
//! ignore-file contents of the snapshot being indexed.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use std::path::Path;

use crate::models::{FileEntry, AUGMENT_IGNORE_FILE, GIT_IGNORE_FILE};

/// Default size cap for indexed files (1 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 1024 * 1024;

/// File names that look like private keys or certificates.
const KEYISH_PATTERNS: &[&str] = &[
    "*.pem",
    "*.key",
    "*.pfx",
    "*.p12",
    "*.pkcs12",
    "*.jks",
    "*.keystore",
    "*.crt",
    "*.cer",
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
];

/// Why a file was excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    AugmentIgnore,
    PathTraversal,
    TooLarge,
    Keyish,
    Binary,
    GitIgnore,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::AugmentIgnore => "augmentignore",
            FilterReason::PathTraversal => "path_traversal",
            FilterReason::TooLarge => "too_large",
            FilterReason::Keyish => "keyish",
            FilterReason::Binary => "binary",
            FilterReason::GitIgnore => "gitignore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Include,
    Exclude(FilterReason),
}

impl FilterDecision {
    pub fn is_included(&self) -> bool {
        matches!(self, FilterDecision::Include)
    }
}

/// Compiled filter for one snapshot of a source.
pub struct FileFilter {
    augment_ignore: Option<Gitignore>,
    git_ignore: Option<Gitignore>,
    keyish: GlobSet,
    max_file_size: usize,
}

impl FileFilter {
    /// Build a filter from the raw contents of `.augmentignore` and
    /// `.gitignore` (either may be absent).
    pub fn new(
        augment_ignore: Option<&str>,
        git_ignore: Option<&str>,
        max_file_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            augment_ignore: augment_ignore.map(compile_ignore).transpose()?,
            git_ignore: git_ignore.map(compile_ignore).transpose()?,
            keyish: build_globset(KEYISH_PATTERNS)?,
            max_file_size,
        })
    }

    /// Build a filter from a snapshot's files, picking up root-level
    /// ignore files if present.
    pub fn from_snapshot(files: &[(String, Vec<u8>)], max_file_size: usize) -> Result<Self> {
        let find = |name: &str| {
            files
                .iter()
                .find(|(path, _)| path == name)
                .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
        };
        let augment = find(AUGMENT_IGNORE_FILE);
        let git = find(GIT_IGNORE_FILE);
        Self::new(augment.as_deref(), git.as_deref(), max_file_size)
    }

    /// Decide whether `path` with `contents` should be indexed.
    pub fn check(&self, path: &str, contents: &[u8]) -> FilterDecision {
        let rel = path.trim_start_matches('/');

        let mut whitelisted = false;
        if let Some(rules) = &self.augment_ignore {
            match match_ignore(rules, rel) {
                Match::Ignore(_) => return FilterDecision::Exclude(FilterReason::AugmentIgnore),
                Match::Whitelist(_) => whitelisted = true,
                Match::None => {}
            }
        }

        if has_parent_segment(rel) {
            return FilterDecision::Exclude(FilterReason::PathTraversal);
        }
        if contents.len() > self.max_file_size {
            return FilterDecision::Exclude(FilterReason::TooLarge);
        }
        let file_name = rel.rsplit('/').next().unwrap_or(rel);
        if self.keyish.is_match(file_name) {
            return FilterDecision::Exclude(FilterReason::Keyish);
        }
        if std::str::from_utf8(contents).is_err() {
            return FilterDecision::Exclude(FilterReason::Binary);
        }

        if !whitelisted {
            if let Some(rules) = &self.git_ignore {
                if match_ignore(rules, rel).is_ignore() {
                    return FilterDecision::Exclude(FilterReason::GitIgnore);
                }
            }
        }

        FilterDecision::Include
    }

    /// Filter raw files into [`FileEntry`]s, dropping excluded ones.
    pub fn apply(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileEntry> {
        let mut entries = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            match self.check(&path, &bytes) {
                FilterDecision::Include => {
                    if let Ok(contents) = String::from_utf8(bytes) {
                        entries.push(FileEntry { path, contents });
                    }
                }
                FilterDecision::Exclude(reason) => {
                    tracing::trace!(path = %path, reason = reason.as_str(), "excluded file");
                }
            }
        }
        entries
    }

    /// Filter a single file, returning its decoded entry when included.
    pub fn admit(&self, path: &str, bytes: Vec<u8>) -> Option<FileEntry> {
        if !self.check(path, &bytes).is_included() {
            return None;
        }
        String::from_utf8(bytes)
            .ok()
            .map(|contents| FileEntry::new(path, contents))
    }
}

fn compile_ignore(contents: &str) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new("");
    for line in contents.lines() {
        builder.add_line(None, line)?;
    }
    Ok(builder.build()?)
}

fn match_ignore<'a>(rules: &'a Gitignore, rel: &str) -> Match<&'a ignore::gitignore::Glob> {
    // Parent directories are checked too so `build/` excludes `build/out.js`.
    rules.matched_path_or_any_parents(Path::new(rel), false)
}

fn has_parent_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|seg| seg == "..")
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
