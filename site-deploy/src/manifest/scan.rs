//! Local manifest producer.
//!
//! Walks the rendered output tree and fingerprints every file so the diff
//! engine can tell which ones changed since the last deployment.

use super::{Manifest, ManifestEntry};
use crate::utils::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Options for scanning a site tree
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Manifest file name at the root; never listed in the manifest itself
    pub manifest_file: String,

    /// Entry names skipped together with everything below them
    pub exclude_names: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            manifest_file: super::DEFAULT_MANIFEST_FILE.to_string(),
            exclude_names: vec![".git".to_string(), ".DS_Store".to_string()],
        }
    }
}

/// Walk `root` and build a manifest of everything below it.
pub fn scan_directory(root: &Path, options: &ScanOptions) -> Result<Manifest> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !should_exclude(e, options));

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let relative = relative_path(entry.path(), root);

        if entry.file_type().is_dir() {
            entries.push(ManifestEntry::directory(relative));
            continue;
        }

        if entry.file_type().is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(target) if target.is_file() => {}
                Ok(_) => {
                    debug!("Skipping symlink to directory: {}", entry.path().display());
                    continue;
                }
                Err(e) => {
                    warn!("Skipping broken symlink {}: {}", entry.path().display(), e);
                    continue;
                }
            }
        }

        let fingerprint = fingerprint_file(entry.path())?;
        entries.push(ManifestEntry::file(relative, fingerprint));
    }

    let manifest = Manifest::new(entries)?;
    info!(
        "Scanned {}: {} entries ({} files)",
        root.display(),
        manifest.len(),
        manifest.file_count()
    );
    Ok(manifest)
}

/// SHA-256 of the file contents as lowercase hex.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Location of the local manifest file for a site root.
pub fn manifest_path(root: &Path, options: &ScanOptions) -> PathBuf {
    root.join(&options.manifest_file)
}

/// Serialize `manifest` into the site root and return the written path.
pub fn write_manifest(root: &Path, manifest: &Manifest, options: &ScanOptions) -> Result<PathBuf> {
    let path = manifest_path(root, options);
    std::fs::write(&path, manifest.to_json()?)?;
    debug!("Wrote local manifest {}", path.display());
    Ok(path)
}

/// Use the manifest the site builder left at the root, or scan and write one.
///
/// A missing or unreadable manifest file, or `rescan`, triggers a fresh scan.
pub fn load_or_scan(root: &Path, options: &ScanOptions, rescan: bool) -> Result<Manifest> {
    let path = manifest_path(root, options);

    if !rescan {
        match std::fs::read(&path) {
            Ok(bytes) => match Manifest::from_slice(&bytes) {
                Ok(manifest) => {
                    info!("Loaded local manifest {} ({} entries)", path.display(), manifest.len());
                    return Ok(manifest);
                }
                Err(e) => warn!("Local manifest {} is unreadable, rescanning: {}", path.display(), e),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let manifest = scan_directory(root, options)?;
    write_manifest(root, &manifest, options)?;
    Ok(manifest)
}

fn relative_path(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn should_exclude(entry: &DirEntry, options: &ScanOptions) -> bool {
    let file_name = entry.file_name().to_string_lossy();

    if entry.depth() == 1 && file_name == options.manifest_file {
        return true;
    }

    options.exclude_names.iter().any(|name| file_name == name.as_str())
}
