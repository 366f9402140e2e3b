//! Unpacked-install verification.
//!
//! Validates a directory tree against the signed manifest embedded inside
//! it: every non-ignored file must match both recorded digests, and every
//! file on disk must either be expected or sit under an ignored prefix.
//! The manifest file itself is covered by a synthesized entry hashing the
//! entire signed stream.

use std::collections::HashMap;
use std::path::{Path, MAIN_SEPARATOR};

use rsa::RsaPublicKey;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::download::{digest_b64, dual_digest_file, dual_digest_reader};
use crate::error::UpdateError;
use crate::manifest::{FileEntry, UpdateInfo, MANIFEST_NAME};
use crate::signed;

/// Tree prefix tolerated wholesale when the `ignore_webroot` flag is set.
const WEBROOT_PREFIX: &str = "webroot";

/// Validate an unpacked install directory against its embedded manifest.
///
/// When `expected` is given, the embedded manifest must also agree with it
/// on display name and release time, which ties a staged tree back to the
/// remote manifest that advertised it.
pub(crate) fn verify_unpacked_tree(
    folder: &Path,
    expected: Option<&UpdateInfo>,
    key: &RsaPublicKey,
    ignore_webroot: bool,
) -> Result<(), UpdateError> {
    let manifest_path = folder.join(MANIFEST_NAME);
    let signed_bytes = std::fs::read(&manifest_path)?;
    let payload = signed::read_verified(std::io::Cursor::new(&signed_bytes), key)?;
    let manifest: UpdateInfo = serde_json::from_slice(&payload)?;

    if let Some(expected) = expected {
        if manifest.displayname != expected.displayname
            || manifest.release_time != expected.release_time
        {
            return Err(UpdateError::VerificationFailed(format!(
                "embedded manifest identity mismatch: {} / {}",
                manifest.displayname, manifest.release_time
            )));
        }
    }

    let files = manifest
        .files
        .as_ref()
        .ok_or_else(|| UpdateError::Format("embedded manifest has no file table".to_string()))?;

    // Expected files, keyed by platform-normalized relative path.
    let mut expected_files: HashMap<String, FileEntry> = HashMap::new();
    let mut ignore_prefixes: Vec<String> = Vec::new();

    for entry in files {
        if !entry.has_safe_path() {
            return Err(UpdateError::PathUnsafe(entry.path.clone()));
        }
        if entry.ignore {
            let mut base = normalize_key(&entry.path);
            while base.ends_with(MAIN_SEPARATOR) {
                base.pop();
            }
            ignore_prefixes.push(base);
        } else {
            expected_files.insert(normalize_key(&entry.path), entry.clone());
        }
    }

    // The manifest file verifies against the digests of its own signed bytes.
    let manifest_entry = {
        let mut cursor = std::io::Cursor::new(&signed_bytes);
        let (sha256, md5) = dual_digest_reader(&mut cursor)?;
        FileEntry {
            path: MANIFEST_NAME.to_string(),
            ignore: false,
            last_write_time: manifest.release_time,
            sha256: Some(digest_b64(&sha256)),
            md5: Some(digest_b64(&md5)),
        }
    };
    expected_files.insert(normalize_key(MANIFEST_NAME), manifest_entry);

    // Walk the tree, matching every file against the expected set.
    for dir_entry in WalkDir::new(folder) {
        let dir_entry = dir_entry.map_err(|e| {
            UpdateError::VerificationFailed(format!("walk failed: {e}"))
        })?;
        if !dir_entry.file_type().is_file() {
            continue;
        }

        let rel = dir_entry
            .path()
            .strip_prefix(folder)
            .map_err(|e| UpdateError::VerificationFailed(e.to_string()))?;
        let key_str = normalize_key(&rel.to_string_lossy());

        if ignore_webroot && under_prefix(&key_str, WEBROOT_PREFIX) {
            continue;
        }

        match expected_files.remove(&key_str) {
            Some(entry) => {
                let (sha256, md5) = dual_digest_file(dir_entry.path())?;
                let sha_ok = entry.sha256.as_deref() == Some(digest_b64(&sha256).as_str());
                let md5_ok = entry.md5.as_deref() == Some(digest_b64(&md5).as_str());
                if !sha_ok || !md5_ok {
                    warn!(path = %rel.display(), "file digest mismatch");
                    return Err(UpdateError::VerificationFailed(format!(
                        "digest mismatch for {}",
                        rel.display()
                    )));
                }
            }
            None => {
                let ignored = ignore_prefixes.iter().any(|base| {
                    key_str == *base
                        || key_str.starts_with(&format!("{base}{MAIN_SEPARATOR}"))
                });
                if !ignored {
                    return Err(UpdateError::VerificationFailed(format!(
                        "unexpected file {}",
                        rel.display()
                    )));
                }
            }
        }
    }

    // Anything expected but never seen is a missing file, unless it is a
    // directory entry or sits under the tolerated webroot.
    let missing: Vec<String> = expected_files
        .into_iter()
        .filter(|(key, entry)| {
            !entry.is_directory() && !(ignore_webroot && under_prefix(key, WEBROOT_PREFIX))
        })
        .map(|(_, entry)| entry.path)
        .collect();

    if !missing.is_empty() {
        return Err(UpdateError::VerificationFailed(format!(
            "missing files: {}",
            missing.join(", ")
        )));
    }

    debug!(folder = %folder.display(), "unpacked tree verified");
    Ok(())
}

/// Normalize a manifest or on-disk relative path into a comparison key:
/// native separators, and case-folded where the platform's filenames are
/// case-insensitive.
fn normalize_key(path: &str) -> String {
    let native: String = path
        .chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect();
    if cfg!(windows) {
        native.to_lowercase()
    } else {
        native
    }
}

/// Whether `key` equals `prefix` or sits underneath it, separator-aware.
fn under_prefix(key: &str, prefix: &str) -> bool {
    let prefix = normalize_key(prefix);
    key == prefix || key.starts_with(&format!("{prefix}{MAIN_SEPARATOR}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signed::testkey::keypair;
    use chrono::{DateTime, TimeZone, Utc};

    fn entry_for(dir: &Path, rel: &str, contents: &[u8], ignore: bool) -> FileEntry {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        let (sha256, md5) = dual_digest_file(&path).unwrap();
        FileEntry {
            path: rel.to_string(),
            ignore,
            last_write_time: DateTime::UNIX_EPOCH,
            sha256: Some(digest_b64(&sha256)),
            md5: Some(digest_b64(&md5)),
        }
    }

    fn release_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    /// Build a valid install tree and return its embedded manifest.
    fn build_tree(dir: &Path, extra_entries: Vec<FileEntry>) -> UpdateInfo {
        let mut files = vec![
            entry_for(dir, "app.bin", b"binary contents", false),
            entry_for(dir, "data/config.json", b"{\"a\":1}", false),
        ];
        files.extend(extra_entries);

        let manifest = UpdateInfo {
            displayname: "demo".to_string(),
            version: "2.1.0.0".to_string(),
            release_time: release_time(),
            release_type: "stable".to_string(),
            compressed_size: 0,
            md5: None,
            sha256: None,
            remote_urls: None,
            uncompressed_size: 22,
            files: Some(files),
        };

        let (private, _) = keypair();
        let payload = serde_json::to_vec(&manifest).unwrap();
        let signed = crate::signed::sign_bytes(&payload, private).unwrap();
        std::fs::write(dir.join(MANIFEST_NAME), signed).unwrap();
        manifest
    }

    #[test]
    fn test_valid_tree_verifies() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let manifest = build_tree(dir.path(), vec![]);

        verify_unpacked_tree(dir.path(), None, &public, false).unwrap();
        verify_unpacked_tree(dir.path(), Some(&manifest), &public, false).unwrap();
    }

    #[test]
    fn test_expected_identity_mismatch() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = build_tree(dir.path(), vec![]);
        manifest.displayname = "something else".to_string();

        assert!(matches!(
            verify_unpacked_tree(dir.path(), Some(&manifest), &public, false),
            Err(UpdateError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_modified_file_fails() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path(), vec![]);

        std::fs::write(dir.path().join("app.bin"), b"tampered").unwrap();
        assert!(matches!(
            verify_unpacked_tree(dir.path(), None, &public, false),
            Err(UpdateError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_unexpected_file_fails() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path(), vec![]);

        std::fs::write(dir.path().join("stray.tmp"), b"?").unwrap();
        assert!(matches!(
            verify_unpacked_tree(dir.path(), None, &public, false),
            Err(UpdateError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_missing_file_fails() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path(), vec![]);

        std::fs::remove_file(dir.path().join("data/config.json")).unwrap();
        let err = verify_unpacked_tree(dir.path(), None, &public, false).unwrap_err();
        assert!(err.to_string().contains("missing files"));
    }

    #[test]
    fn test_ignore_prefix_tolerates_content() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let ignore_dir = FileEntry {
            path: "cache/".to_string(),
            ignore: true,
            last_write_time: DateTime::UNIX_EPOCH,
            sha256: None,
            md5: None,
        };
        build_tree(dir.path(), vec![ignore_dir]);

        std::fs::create_dir_all(dir.path().join("cache/sub")).unwrap();
        std::fs::write(dir.path().join("cache/sub/junk.db"), b"junk").unwrap();

        verify_unpacked_tree(dir.path(), None, &public, false).unwrap();
    }

    #[test]
    fn test_ignored_file_may_be_absent() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        // Entry exists in the manifest as ignored but never on disk.
        let optional = FileEntry {
            path: "optional.log".to_string(),
            ignore: true,
            last_write_time: DateTime::UNIX_EPOCH,
            sha256: None,
            md5: None,
        };
        build_tree(dir.path(), vec![optional]);

        verify_unpacked_tree(dir.path(), None, &public, false).unwrap();
    }

    #[test]
    fn test_ignored_file_present_is_skipped() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let optional = FileEntry {
            path: "optional.log".to_string(),
            ignore: true,
            last_write_time: DateTime::UNIX_EPOCH,
            sha256: None,
            md5: None,
        };
        build_tree(dir.path(), vec![optional]);

        // Present with arbitrary content: tolerated, never hashed.
        std::fs::write(dir.path().join("optional.log"), b"anything").unwrap();
        verify_unpacked_tree(dir.path(), None, &public, false).unwrap();
    }

    #[test]
    fn test_webroot_flag() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path(), vec![]);

        std::fs::create_dir_all(dir.path().join("webroot/assets")).unwrap();
        std::fs::write(dir.path().join("webroot/assets/site.css"), b"body{}").unwrap();

        // Without the flag the extra content is an unexpected file.
        assert!(verify_unpacked_tree(dir.path(), None, &public, false).is_err());
        // With the flag webroot content is tolerated.
        verify_unpacked_tree(dir.path(), None, &public, true).unwrap();
    }

    #[test]
    fn test_tampered_manifest_fails() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path(), vec![]);

        let manifest_path = dir.path().join(MANIFEST_NAME);
        let mut bytes = std::fs::read(&manifest_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&manifest_path, bytes).unwrap();

        assert!(matches!(
            verify_unpacked_tree(dir.path(), None, &public, false),
            Err(UpdateError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_unsafe_manifest_path_rejected() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let evil = FileEntry {
            path: "../escape".to_string(),
            ignore: false,
            last_write_time: DateTime::UNIX_EPOCH,
            sha256: Some("x".to_string()),
            md5: Some("y".to_string()),
        };
        build_tree(dir.path(), vec![evil]);

        assert!(matches!(
            verify_unpacked_tree(dir.path(), None, &public, false),
            Err(UpdateError::PathUnsafe(_))
        ));
    }

    #[test]
    fn test_missing_manifest_is_filesystem_error() {
        let (_, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify_unpacked_tree(dir.path(), None, &public, false),
            Err(UpdateError::Filesystem(_))
        ));
    }
}
