//! Manifest diff engine.
//!
//! Compares the local manifest against the one downloaded from the remote
//! root and produces the ordered operation queue that makes the remote tree
//! match the local one.

use super::operation::DeployOperation;
use crate::manifest::{ancestors, Manifest, ManifestEntry};
use std::cmp::Reverse;

/// Compute the operation queue for one deployment.
///
/// With no usable remote manifest every local entry is (re)created and
/// nothing is deleted. Queue order:
///
/// 1. removals of remote entries that collide with a local entry of the
///    other kind, children first
/// 2. `mkdir` for new directories, parents first
/// 3. `upload` for new and changed files
/// 4. `delete-file` / `rmdir` for entries gone locally, children first
pub fn diff(local: &Manifest, remote: Option<&Manifest>) -> Vec<DeployOperation> {
    let Some(remote) = remote else {
        return creations(local.entries().iter());
    };

    let local_index = local.index();
    let remote_index = remote.index();

    let changed = local.entries().iter().filter(|entry| {
        match remote_index.get(entry.path.as_str()) {
            None => true,
            Some(existing) if existing.kind != entry.kind => true,
            Some(existing) => !entry.is_dir() && existing.fingerprint != entry.fingerprint,
        }
    });

    let mut conflicting = Vec::new();
    let mut removed = Vec::new();
    for entry in remote.entries() {
        match local_index.get(entry.path.as_str()) {
            Some(local_entry) if local_entry.kind == entry.kind => {}
            Some(_) => conflicting.push(entry),
            None => {
                let under_local_file = ancestors(&entry.path)
                    .any(|a| local_index.get(a).is_some_and(|l| !l.is_dir()));
                if under_local_file {
                    conflicting.push(entry);
                } else {
                    removed.push(entry);
                }
            }
        }
    }

    let mut queue = removals(conflicting);
    queue.extend(creations(changed));
    queue.extend(removals(removed));
    queue
}

fn creations<'a>(entries: impl Iterator<Item = &'a ManifestEntry>) -> Vec<DeployOperation> {
    let (mut dirs, mut files): (Vec<&ManifestEntry>, Vec<&ManifestEntry>) =
        entries.partition(|e| e.is_dir());

    dirs.sort_by(|a, b| (a.depth(), &a.path).cmp(&(b.depth(), &b.path)));
    files.sort_by(|a, b| (a.depth(), &a.path).cmp(&(b.depth(), &b.path)));

    dirs.into_iter()
        .map(|e| DeployOperation::mkdir(e.path.clone()))
        .chain(files.into_iter().map(|e| DeployOperation::upload(e.path.clone())))
        .collect()
}

fn removals(mut entries: Vec<&ManifestEntry>) -> Vec<DeployOperation> {
    // deepest first; files before directories at the same depth
    entries.sort_by(|a, b| {
        (Reverse(a.depth()), a.is_dir(), &a.path).cmp(&(Reverse(b.depth()), b.is_dir(), &b.path))
    });

    entries
        .into_iter()
        .map(|e| {
            if e.is_dir() {
                DeployOperation::rmdir(e.path.clone())
            } else {
                DeployOperation::delete_file(e.path.clone())
            }
        })
        .collect()
}
