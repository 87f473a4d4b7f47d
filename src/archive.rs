//! Archive extraction into per-request scratch space
//!
//! Fetched archives are zip containers. Extraction targets a subdirectory of
//! the request's scratch directory whose name is derived from the archive
//! identifier, so multiple CIDs extracted for one request never collide.
//!
//! ## Invariants
//! - No entry may escape the destination: entries whose normalized path walks
//!   outside the target subdirectory are rejected before any byte is written.
//! - Partial extraction on error leaves the subdirectory in place; the
//!   orchestrator owns scratch cleanup and removes the whole tree on exit.
//!
//! Unpacking is CPU/disk-bound, so it runs on the blocking pool.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

/// Errors surfaced by archive extraction.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The container is not a readable zip.
    #[error("malformed archive: {0}")]
    Malformed(#[from] zip::result::ZipError),
    /// An entry's path would escape the extraction root.
    #[error("archive entry escapes extraction root: {0}")]
    UnsafePath(String),
    /// Filesystem failure while writing extracted entries.
    #[error("extraction I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The blocking extraction task was cancelled or panicked.
    #[error("extraction task failed: {0}")]
    Task(String),
}

/// Subdirectory name for an archive identified by `key` (typically the CID).
/// Uses a short digest so untrusted identifiers never reach the filesystem.
pub fn subdir_name(key: &str) -> String {
    let digest = blake3::hash(key.as_bytes());
    format!("arc_{}", hex::encode(&digest.as_bytes()[..8]))
}

/// Unpack `bytes` under `scratch_dir` and return the extraction root.
pub async fn extract(
    bytes: Vec<u8>,
    scratch_dir: &Path,
    key: &str,
) -> Result<PathBuf, ArchiveError> {
    let dest = scratch_dir.join(subdir_name(key));
    let task_dest = dest.clone();
    tokio::task::spawn_blocking(move || extract_blocking(&bytes, &task_dest))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))??;
    Ok(dest)
}

fn extract_blocking(bytes: &[u8], dest: &Path) -> Result<(), ArchiveError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    fs::create_dir_all(dest)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafePath(entry.name().to_string()))?;
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(ArchiveError::UnsafePath(entry.name().to_string()));
        }
        let out = dest.join(&rel);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            w.start_file(*name, SimpleFileOptions::default()).unwrap();
            w.write_all(data).unwrap();
        }
        w.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn extracts_nested_entries() {
        let scratch = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[
            ("manifest.json", b"{}"),
            ("docs/brief.txt", b"the brief"),
        ]);
        let root = extract(bytes, scratch.path(), "QmA").await.unwrap();
        assert_eq!(fs::read(root.join("manifest.json")).unwrap(), b"{}");
        assert_eq!(fs::read(root.join("docs/brief.txt")).unwrap(), b"the brief");
    }

    #[tokio::test]
    async fn rejects_traversal_entry() {
        let scratch = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[("../evil.txt", b"gotcha")]);
        let err = extract(bytes, scratch.path(), "QmB").await.unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
        assert!(!scratch.path().parent().unwrap().join("evil.txt").exists());
    }

    #[tokio::test]
    async fn rejects_garbage_bytes() {
        let scratch = tempfile::tempdir().unwrap();
        let err = extract(b"not a zip".to_vec(), scratch.path(), "QmC")
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn subdir_names_are_distinct_and_safe() {
        let a = subdir_name("QmA");
        let b = subdir_name("QmB");
        assert_ne!(a, b);
        assert!(a.starts_with("arc_") && a.len() == 4 + 16);
        // Hostile identifiers never appear verbatim in the path.
        assert!(!subdir_name("../../etc").contains(".."));
    }
}
