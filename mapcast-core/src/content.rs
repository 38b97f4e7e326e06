//! Content set model (§3 "Content entry"): a POSIX-normalized relative
//! path, size, and digest, with a folder-diff used by the sync engine
//! (C7) to decide what to upload/delete against a peer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One file in a content set, keyed externally by its `rel_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub rel_path: String,
    pub size: u64,
    pub digest: String,
}

/// `rel_path -> (size, digest)`. `BTreeMap` gives the deterministic
/// iteration order spec §4.7 requires ("sort by rel_path") for free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentSet(BTreeMap<String, ContentEntry>);

impl ContentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, entry: ContentEntry) {
        self.0.insert(entry.rel_path.clone(), entry);
    }

    pub fn remove(&mut self, rel_path: &str) {
        self.0.remove(rel_path);
    }

    pub fn get(&self, rel_path: &str) -> Option<&ContentEntry> {
        self.0.get(rel_path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ContentEntry> {
        self.0.values()
    }

    /// Serialize as `rel_path|size|digest\n` lines, the wire shape the
    /// `LIST` bulk-transport operation returns (spec §4.8).
    pub fn to_list_text(&self) -> String {
        let mut out = String::new();
        for e in self.0.values() {
            out.push_str(&e.rel_path);
            out.push('|');
            out.push_str(&e.size.to_string());
            out.push('|');
            out.push_str(&e.digest);
            out.push('\n');
        }
        out
    }

    pub fn from_list_text(text: &str) -> Self {
        let mut set = Self::new();
        for line in text.lines() {
            let mut parts = line.splitn(3, '|');
            if let (Some(rel_path), Some(size), Some(digest)) =
                (parts.next(), parts.next(), parts.next())
            {
                if let Ok(size) = size.parse::<u64>() {
                    set.upsert(ContentEntry {
                        rel_path: rel_path.to_string(),
                        size,
                        digest: digest.to_string(),
                    });
                }
            }
        }
        set
    }
}

/// Plan of action to converge a peer's content set onto `local`.
/// Upload takes precedence over delete for the same path (spec §4.7
/// tie-break): a path present on both sides with a differing digest is an
/// upload, never simultaneously queued as a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffPlan {
    pub uploads: Vec<String>,
    pub deletes: Vec<String>,
}

impl DiffPlan {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletes.is_empty()
    }
}

/// Compute what must change on `remote` to match `local`.
pub fn diff(local: &ContentSet, remote: &ContentSet) -> DiffPlan {
    let mut uploads = Vec::new();
    for entry in local.entries() {
        match remote.get(&entry.rel_path) {
            Some(remote_entry) if remote_entry.digest == entry.digest => {}
            _ => uploads.push(entry.rel_path.clone()),
        }
    }

    let mut deletes = Vec::new();
    for entry in remote.entries() {
        if local.get(&entry.rel_path).is_none() {
            deletes.push(entry.rel_path.clone());
        }
    }

    uploads.sort();
    deletes.sort();
    DiffPlan { uploads, deletes }
}

/// Normalize a relative path to POSIX form (forward slashes, no leading
/// slash, no `..` components) relative to `root`. Used both for watcher
/// output and for path-safety checks before resolving a wire-received
/// path against a root (spec §4.8 "Path safety").
pub fn normalize_rel_path(root: &Path, absolute: &Path) -> Option<String> {
    let rel = absolute.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            std::path::Component::Normal(s) => parts.push(s.to_string_lossy().to_string()),
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => return None,
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Walk `root` and build a content set from the files found there,
/// hashing each through `hasher` (cache-or-compute). Used both by the
/// sync engine to capture the local content set and by the transport
/// server to answer `LIST` (spec §4.7, §4.8).
pub fn build_content_set(root: &Path, hasher: &crate::hash::HashCache) -> ContentSet {
    let mut set = ContentSet::new();
    for (rel, abs, _mtime) in crate::watch::scan_tree(root) {
        let Ok(metadata) = std::fs::metadata(&abs) else {
            continue;
        };
        match hasher.digest(&abs) {
            Ok(digest) => set.upsert(ContentEntry {
                rel_path: rel,
                size: metadata.len(),
                digest,
            }),
            Err(e) => {
                tracing::debug!("content: skipping {} (hash failed: {})", rel, e);
            }
        }
    }
    set
}

/// Resolve a wire-received relative path against `root`, rejecting any
/// path that would escape it (absolute paths, `..` components).
pub fn safe_resolve(root: &Path, rel_path: &str) -> Option<PathBuf> {
    let rel_path = rel_path.trim_start_matches('/');
    let mut resolved = root.to_path_buf();
    for part in rel_path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            return None;
        }
        resolved.push(part);
    }
    if resolved == root {
        return None;
    }
    Some(resolved)
}
