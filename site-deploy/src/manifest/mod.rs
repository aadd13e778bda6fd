//! Manifest types shared by the local scanner, the diff engine and the publisher.
//!
//! A manifest is a flat listing of every file and directory of a site tree.
//! The copy stored at the remote root records what the last successful
//! deployment left behind; diffing it against the local manifest tells the
//! engine what to transfer.

pub mod scan;

use crate::utils::{DeployError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Current on-disk manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Default name of the manifest file at the site root (local and remote).
pub const DEFAULT_MANIFEST_FILE: &str = "files.manifest.json";

/// Whether an entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One file or directory known to exist on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Slash-normalized path relative to the site root
    pub path: String,

    pub kind: EntryKind,

    /// Change signature for files; directories carry none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl ManifestEntry {
    pub fn file(path: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            fingerprint: Some(fingerprint.into()),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            fingerprint: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Number of path segments (`a` is 1, `a/b` is 2).
    pub fn depth(&self) -> usize {
        path_depth(&self.path)
    }
}

/// Immutable snapshot of a site tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest from raw entries.
    ///
    /// Paths are normalized, ancestors missing from the listing are added as
    /// directories, and duplicate paths are rejected.
    pub fn new(entries: Vec<ManifestEntry>) -> Result<Self> {
        Ok(Self {
            version: MANIFEST_VERSION,
            generated_at: Utc::now(),
            entries: normalize_entries(entries)?,
        })
    }

    /// Parse a serialized manifest, validating it the same way as [`Manifest::new`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: Manifest = serde_json::from_slice(bytes)?;
        if raw.version != MANIFEST_VERSION {
            return Err(DeployError::InvalidManifest(format!(
                "unsupported manifest version {}",
                raw.version
            )));
        }

        Ok(Self {
            version: raw.version,
            generated_at: raw.generated_at,
            entries: normalize_entries(raw.entries)?,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of file entries.
    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_dir()).count()
    }

    /// Entries keyed by path.
    pub fn index(&self) -> BTreeMap<&str, &ManifestEntry> {
        self.entries.iter().map(|e| (e.path.as_str(), e)).collect()
    }
}

fn normalize_entries(entries: Vec<ManifestEntry>) -> Result<Vec<ManifestEntry>> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(entries.len());

    for mut entry in entries {
        entry.path = normalize_path(&entry.path)?;
        if entry.path.is_empty() {
            // the root itself is implicit
            continue;
        }
        if entry.is_dir() {
            entry.fingerprint = None;
        }
        if !seen.insert(entry.path.clone()) {
            return Err(DeployError::InvalidManifest(format!(
                "duplicate path: {}",
                entry.path
            )));
        }
        normalized.push(entry);
    }

    let mut implied = Vec::new();
    for entry in &normalized {
        for ancestor in ancestors(&entry.path) {
            if seen.insert(ancestor.to_string()) {
                implied.push(ManifestEntry::directory(ancestor));
            }
        }
    }
    normalized.extend(implied);

    // An ancestor listed as a file is a contradiction
    let files: HashSet<&str> = normalized
        .iter()
        .filter(|e| !e.is_dir())
        .map(|e| e.path.as_str())
        .collect();
    for entry in &normalized {
        if let Some(parent) = ancestors(&entry.path).find(|a| files.contains(a)) {
            return Err(DeployError::InvalidManifest(format!(
                "{} is listed as a file but contains {}",
                parent, entry.path
            )));
        }
    }

    Ok(normalized)
}

/// Normalize a site-relative path to `a/b/c` form.
///
/// Backslashes become slashes; leading `./` and `/`, empty and `.` segments
/// and trailing slashes are dropped. `..` segments are rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    let replaced = path.replace('\\', "/");
    let mut segments = Vec::new();

    for segment in replaced.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(DeployError::InvalidManifest(format!(
                    "path escapes the site root: {}",
                    path
                )))
            }
            s => segments.push(s),
        }
    }

    Ok(segments.join("/"))
}

/// Proper ancestors of a normalized path, nearest first (`a/b/c` yields `a/b`, `a`).
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .rev()
        .filter(|&(_, c)| c == '/')
        .map(move |(i, _)| &path[..i])
}

pub fn path_depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

/// Join a site-relative path onto a remote root directory.
pub fn remote_join(root: &str, relative: &str) -> String {
    if relative.is_empty() {
        root.to_string()
    } else if root.is_empty() {
        relative.to_string()
    } else if root.ends_with('/') {
        format!("{}{}", root, relative)
    } else {
        format!("{}/{}", root, relative)
    }
}
