//! Content-addressed hasher (C3): absolute path -> strong digest, cached
//! process-wide and invalidated on mutation.
//!
//! Cache ownership mirrors `FileWatcher::watchers: Arc<RwLock<HashMap<...>>>`
//! in the teacher's `scanner/file_watcher.rs` — one mutex, no nested
//! locking, holders never do IO while holding the lock. Digest is a
//! streamed `sha2::Sha256` (spec §9 explicitly flags whole-file-in-memory
//! hashing as a liability) formatted as 32 lowercase hex characters — the
//! low half of the 64-character SHA-256 hex output is truncated to match
//! the `[32-char hex]` digest the wire format carries (spec §3).

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest as _, Sha256};

use crate::error::Result;

pub type Digest = String;

const READ_CHUNK: usize = 64 * 1024;

/// Stream-hash a file's full contents without holding the whole buffer in
/// memory at once.
fn digest_file(path: &Path) -> Result<Digest> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let full = hex::encode(hasher.finalize());
    Ok(full[..32].to_string())
}

/// Process-wide, mutex-protected, lazily-populated digest cache.
#[derive(Debug, Default)]
pub struct HashCache {
    entries: Mutex<HashMap<PathBuf, Digest>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached digest for `path`, computing and caching it on
    /// first access.
    pub fn digest(&self, path: &Path) -> Result<Digest> {
        if let Some(cached) = self.entries.lock().unwrap().get(path).cloned() {
            return Ok(cached);
        }

        let digest = digest_file(path)?;
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), digest.clone());
        Ok(digest)
    }

    /// Invalidate the cache entry for `path`; must be called after any
    /// successful write or delete of the file.
    pub fn invalidate(&self, path: &Path) {
        self.entries.lock().unwrap().remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
