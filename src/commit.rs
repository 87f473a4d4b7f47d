//! Commit/reveal store
//!
//! The two-phase oracle protocol binds the arbiter to a verdict with a short
//! hash first and discloses the payload on demand later. This store is the
//! keyed map from commit hash to the deferred payload.
//!
//! ## Concurrency
//! The store is the only process-wide mutable state. All four operations
//! (`save`, `get`, `delete`, `purge_stale`) serialize through one mutex and
//! follow the same shape: load a complete snapshot, mutate it, write it back
//! atomically.
//!
//! ## Backends
//! Selected at process start, never at runtime:
//! - **memory**: the snapshot is the in-process map; disk is never touched.
//! - **file**: the snapshot is read from a JSON file on every operation and
//!   written back via temp-file-and-rename. A missing or corrupt file is an
//!   empty store, so a half-written file after a crash cannot wedge the
//!   process.
//!
//! Keys are 16-byte digests rendered as 32 hex characters. A colliding
//! `save` overwrites the earlier entry (the digest covers the payload, so a
//! practical collision is the same payload).

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::COMMIT_HASH_BYTES;

/// Default entry lifetime before purge: 3 days.
pub const DEFAULT_COMMIT_TTL: Duration = Duration::from_secs(3 * 24 * 3600);

/// Errors surfaced by the commit store.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// File-backend I/O failed.
    #[error("commit store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot serialization failed.
    #[error("commit store serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    /// The store mutex was poisoned by a panicking holder.
    #[error("commit store lock poisoned")]
    Poisoned,
}

/// Durability mode, fixed at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMode {
    /// In-process map; entries die with the process.
    Memory,
    /// JSON file at the given path; entries survive restarts.
    File(PathBuf),
}

/// One stored commitment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitEntry {
    /// The deferred reveal payload.
    pub payload: serde_json::Value,
    /// Commit time.
    pub created: DateTime<Utc>,
}

type Snapshot = HashMap<String, CommitEntry>;

enum Backend {
    Memory(Snapshot),
    File(PathBuf),
}

/// The commit/reveal map. All operations serialize through one mutex.
pub struct CommitStore {
    inner: Mutex<Backend>,
}

/// Commit hash for a payload: first 16 bytes of SHA-256 over its canonical
/// JSON encoding, rendered as hex.
pub fn commit_hash(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..COMMIT_HASH_BYTES])
}

impl CommitStore {
    /// Open a store in the given mode.
    pub fn open(mode: CommitMode) -> Self {
        let backend = match mode {
            CommitMode::Memory => Backend::Memory(Snapshot::new()),
            CommitMode::File(path) => Backend::File(path),
        };
        Self {
            inner: Mutex::new(backend),
        }
    }

    /// Convenience constructor for the ephemeral backend.
    pub fn in_memory() -> Self {
        Self::open(CommitMode::Memory)
    }

    /// Store `payload` under `hash`. A colliding hash overwrites.
    pub fn save(&self, hash: &str, payload: serde_json::Value) -> Result<(), CommitError> {
        self.mutate(|snap| {
            let prior = snap.insert(
                hash.to_string(),
                CommitEntry {
                    payload,
                    created: Utc::now(),
                },
            );
            if prior.is_some() {
                warn!(hash, "overwrote existing commitment with the same hash");
            }
            true
        })
        .map(|_| ())
    }

    /// Look up a commitment without consuming it.
    pub fn get(&self, hash: &str) -> Result<Option<CommitEntry>, CommitError> {
        let guard = self.inner.lock().map_err(|_| CommitError::Poisoned)?;
        let snap = Self::load(&guard)?;
        Ok(snap.get(hash).cloned())
    }

    /// Remove a commitment. Returns whether it existed.
    pub fn delete(&self, hash: &str) -> Result<bool, CommitError> {
        self.mutate(|snap| snap.remove(hash).is_some())
    }

    /// Remove every entry older than `max_age`; returns the removed count.
    pub fn purge_stale(&self, max_age: Duration) -> Result<usize, CommitError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut removed = 0;
        self.mutate(|snap| {
            let before = snap.len();
            snap.retain(|_, e| e.created >= cutoff);
            removed = before - snap.len();
            removed > 0
        })?;
        if removed > 0 {
            debug!(removed, "purged stale commitments");
        }
        Ok(removed)
    }

    /// Number of live entries (diagnostics).
    pub fn len(&self) -> Result<usize, CommitError> {
        let guard = self.inner.lock().map_err(|_| CommitError::Poisoned)?;
        Ok(Self::load(&guard)?.len())
    }

    /// True when no commitments are outstanding.
    pub fn is_empty(&self) -> Result<bool, CommitError> {
        Ok(self.len()? == 0)
    }

    /// Load-snapshot → mutate → write-back, under the lock. `f` returns
    /// whether the snapshot changed; an unchanged file-backend snapshot is
    /// not rewritten.
    fn mutate<F>(&self, f: F) -> Result<bool, CommitError>
    where
        F: FnOnce(&mut Snapshot) -> bool,
    {
        let mut guard = self.inner.lock().map_err(|_| CommitError::Poisoned)?;
        let mut snap = Self::load(&guard)?;
        let changed = f(&mut snap);
        if changed {
            Self::write_back(&mut guard, snap)?;
        }
        Ok(changed)
    }

    fn load(backend: &Backend) -> Result<Snapshot, CommitError> {
        match backend {
            Backend::Memory(map) => Ok(map.clone()),
            Backend::File(path) => match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(snap) => Ok(snap),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "corrupt commit file; treating as empty");
                        Ok(Snapshot::new())
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::new()),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn write_back(backend: &mut Backend, snap: Snapshot) -> Result<(), CommitError> {
        match backend {
            Backend::Memory(map) => {
                *map = snap;
                Ok(())
            }
            Backend::File(path) => {
                let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
                let mut tmp = match dir {
                    Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
                    None => tempfile::NamedTempFile::new()?,
                };
                tmp.write_all(&serde_json::to_vec_pretty(&snap)?)?;
                tmp.flush()?;
                tmp.persist(path).map_err(|e| CommitError::Io(e.error))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(tag: &str) -> serde_json::Value {
        json!({ "aggregatedScore": [600_000, 400_000], "justificationCID": tag })
    }

    #[test]
    fn commit_then_reveal_then_not_found() {
        let store = CommitStore::in_memory();
        let p = payload("QmJ1");
        let hash = commit_hash(&p);
        assert_eq!(hash.len(), COMMIT_HASH_BYTES * 2);

        store.save(&hash, p.clone()).unwrap();
        let entry = store.get(&hash).unwrap().expect("committed entry");
        assert_eq!(entry.payload, p);

        assert!(store.delete(&hash).unwrap());
        assert!(store.get(&hash).unwrap().is_none());
        assert!(!store.delete(&hash).unwrap());
    }

    #[test]
    fn commit_hash_is_deterministic_and_payload_sensitive() {
        assert_eq!(commit_hash(&payload("a")), commit_hash(&payload("a")));
        assert_ne!(commit_hash(&payload("a")), commit_hash(&payload("b")));
    }

    #[test]
    fn later_save_wins_on_collision() {
        let store = CommitStore::in_memory();
        store.save("aa".repeat(16).as_str(), payload("first")).unwrap();
        store.save("aa".repeat(16).as_str(), payload("second")).unwrap();
        let entry = store.get("aa".repeat(16).as_str()).unwrap().unwrap();
        assert_eq!(entry.payload, payload("second"));
    }

    #[test]
    fn purge_removes_exactly_the_stale_entries() {
        let store = CommitStore::in_memory();
        store.save("old0", payload("old")).unwrap();
        store.save("new0", payload("new")).unwrap();
        // Backdate one entry directly through the backend.
        {
            let mut guard = store.inner.lock().unwrap();
            if let Backend::Memory(map) = &mut *guard {
                map.get_mut("old0").unwrap().created =
                    Utc::now() - chrono::Duration::days(4);
            }
        }
        let removed = store.purge_stale(DEFAULT_COMMIT_TTL).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("old0").unwrap().is_none());
        assert!(store.get("new0").unwrap().is_some());
    }

    #[test]
    fn file_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commits.json");
        let p = payload("QmDurable");
        let hash = commit_hash(&p);

        {
            let store = CommitStore::open(CommitMode::File(path.clone()));
            store.save(&hash, p.clone()).unwrap();
        }
        let reopened = CommitStore::open(CommitMode::File(path.clone()));
        let entry = reopened.get(&hash).unwrap().expect("persisted entry");
        assert_eq!(entry.payload, p);

        // The file on disk is the snapshot itself.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("QmDurable"));
    }

    #[test]
    fn corrupt_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commits.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = CommitStore::open(CommitMode::File(path));
        assert!(store.is_empty().unwrap());
        store.save("ab".repeat(16).as_str(), payload("x")).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }
}
