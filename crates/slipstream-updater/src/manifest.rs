//! Update manifest model.
//!
//! A manifest comes in two shapes sharing one record. The *remote* manifest
//! is served over HTTP and describes the package archive: digests, size,
//! and candidate download URLs; its `files` is null. The *embedded* manifest
//! travels inside the archive as `autoupdate.manifest` and carries the
//! per-file table used for post-install verification; its `remote_urls` is
//! null. Either shape is only ever accepted through the signed-stream codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ReleaseType;
use crate::version::VersionQuad;

/// Name of the signed manifest file, both as an archive member and on disk
/// inside every installed version folder.
pub const MANIFEST_NAME: &str = "autoupdate.manifest";

/// A release described by a signed manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Human-readable product name
    #[serde(default)]
    pub displayname: String,

    /// Dotted version string; parsed leniently (unparsable reads as `0.0`)
    #[serde(default)]
    pub version: String,

    /// Release instant; the Unix epoch means "unknown"
    #[serde(default = "epoch")]
    pub release_time: DateTime<Utc>,

    /// Release track name; parsed case-insensitively
    #[serde(default)]
    pub release_type: String,

    /// Size in bytes of the package archive
    #[serde(default)]
    pub compressed_size: u64,

    /// Base64 MD5 digest of the package archive (remote manifest only)
    #[serde(rename = "MD5", default)]
    pub md5: Option<String>,

    /// Base64 SHA-256 digest of the package archive (remote manifest only)
    #[serde(rename = "SHA256", default)]
    pub sha256: Option<String>,

    /// Candidate package URLs in preference order (remote manifest only)
    #[serde(default)]
    pub remote_urls: Option<Vec<String>>,

    /// Sum of member sizes of the unpacked tree
    #[serde(default)]
    pub uncompressed_size: u64,

    /// Per-file table for install verification (embedded manifest only)
    #[serde(default)]
    pub files: Option<Vec<FileEntry>>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl UpdateInfo {
    /// The version under the four-component parse policy.
    pub fn parsed_version(&self) -> VersionQuad {
        VersionQuad::parse(&self.version)
    }

    /// The release type, `Unknown` for anything unrecognized.
    pub fn parsed_release_type(&self) -> ReleaseType {
        ReleaseType::parse(&self.release_type)
    }

    /// Whether the release instant is the "unknown" sentinel.
    pub fn release_time_unknown(&self) -> bool {
        self.release_time == DateTime::UNIX_EPOCH
    }

    /// Whether this is the remote (download descriptor) shape.
    pub fn is_remote(&self) -> bool {
        self.files.is_none() && self.remote_urls.is_some()
    }

    /// Whether this is the embedded (per-file table) shape.
    pub fn is_embedded(&self) -> bool {
        self.files.is_some()
    }

    /// File name of the package, taken from the first remote URL.
    ///
    /// Used to rewrite alternate mirror URLs, which name a directory and
    /// need the primary package file name spliced onto them.
    pub fn package_filename(&self) -> Option<&str> {
        let urls = self.remote_urls.as_ref()?;
        let first = urls.first()?;
        let tail = first.rsplit('/').next()?;
        if tail.is_empty() {
            None
        } else {
            Some(tail)
        }
    }
}

/// One file (or directory) of an unpacked installation.
///
/// Directory entries have a trailing `/` and no digests. Entries with
/// `ignore` set may or may not exist on disk; ignored directories define
/// prefixes under which anything is tolerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Archive-relative path, forward-slash separated
    pub path: String,

    /// Whether the entry is exempt from verification
    #[serde(default)]
    pub ignore: bool,

    /// Last modification instant recorded at packaging time
    #[serde(default = "epoch")]
    pub last_write_time: DateTime<Utc>,

    /// Base64 SHA-256 digest of the file contents; null for directories
    #[serde(rename = "SHA256", default)]
    pub sha256: Option<String>,

    /// Base64 MD5 digest of the file contents; null for directories
    #[serde(rename = "MD5", default)]
    pub md5: Option<String>,
}

impl FileEntry {
    /// Whether this entry names a directory.
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Whether the path honors the manifest invariants: relative, no `..`
    /// segments.
    pub fn has_safe_path(&self) -> bool {
        !self.path.starts_with('/')
            && !self.path.starts_with('\\')
            && !self.path.contains(':')
            && !self
                .path
                .split(['/', '\\'])
                .any(|segment| segment == "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_manifest_json() -> &'static str {
        r#"{
            "displayname": "Slipstream Demo",
            "version": "2.1.0.0",
            "release_time": "2026-03-01T12:00:00Z",
            "release_type": "Stable",
            "compressed_size": 4096,
            "MD5": "1B2M2Y8AsgTpgAmY7PhCfg==",
            "SHA256": "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=",
            "remote_urls": ["https://updates.example.com/stable/package.zip"],
            "uncompressed_size": 0,
            "files": null
        }"#
    }

    #[test]
    fn test_remote_manifest_parses() {
        let info: UpdateInfo = serde_json::from_str(remote_manifest_json()).unwrap();
        assert_eq!(info.displayname, "Slipstream Demo");
        assert_eq!(info.parsed_version(), VersionQuad::parse("2.1.0.0"));
        assert_eq!(info.parsed_release_type(), ReleaseType::Stable);
        assert!(info.is_remote());
        assert!(!info.is_embedded());
        assert_eq!(info.package_filename(), Some("package.zip"));
        assert!(!info.release_time_unknown());
    }

    #[test]
    fn test_embedded_manifest_shape() {
        let info = UpdateInfo {
            displayname: "app".to_string(),
            version: "1.0".to_string(),
            release_time: DateTime::UNIX_EPOCH,
            release_type: "stable".to_string(),
            compressed_size: 0,
            md5: None,
            sha256: None,
            remote_urls: None,
            uncompressed_size: 10,
            files: Some(vec![FileEntry {
                path: "bin/app".to_string(),
                ignore: false,
                last_write_time: DateTime::UNIX_EPOCH,
                sha256: Some("x".to_string()),
                md5: Some("y".to_string()),
            }]),
        };
        assert!(info.is_embedded());
        assert!(!info.is_remote());
        assert!(info.release_time_unknown());
    }

    #[test]
    fn test_missing_fields_default() {
        let info: UpdateInfo = serde_json::from_str("{}").unwrap();
        assert_eq!(info.version, "");
        assert_eq!(info.parsed_version(), VersionQuad::ZERO);
        assert_eq!(info.parsed_release_type(), ReleaseType::Unknown);
        assert!(info.release_time_unknown());
        assert!(info.files.is_none());
        assert!(info.remote_urls.is_none());
    }

    #[test]
    fn test_digest_field_names_roundtrip() {
        let info: UpdateInfo = serde_json::from_str(remote_manifest_json()).unwrap();
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"MD5\""));
        assert!(json.contains("\"SHA256\""));
        let back: UpdateInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_file_entry_directory() {
        let dir = FileEntry {
            path: "webroot/".to_string(),
            ignore: true,
            last_write_time: DateTime::UNIX_EPOCH,
            sha256: None,
            md5: None,
        };
        assert!(dir.is_directory());
        assert!(dir.has_safe_path());
    }

    #[test]
    fn test_file_entry_path_safety() {
        let mk = |path: &str| FileEntry {
            path: path.to_string(),
            ignore: false,
            last_write_time: DateTime::UNIX_EPOCH,
            sha256: None,
            md5: None,
        };
        assert!(mk("bin/app.dll").has_safe_path());
        assert!(!mk("../escape").has_safe_path());
        assert!(!mk("a/../../b").has_safe_path());
        assert!(!mk("/etc/passwd").has_safe_path());
        assert!(!mk("C:/windows/system32").has_safe_path());
        assert!(!mk("..\\escape").has_safe_path());
    }

    #[test]
    fn test_package_filename_edge_cases() {
        let mut info: UpdateInfo = serde_json::from_str(remote_manifest_json()).unwrap();
        info.remote_urls = Some(vec!["https://updates.example.com/dir/".to_string()]);
        assert_eq!(info.package_filename(), None);
        info.remote_urls = Some(vec![]);
        assert_eq!(info.package_filename(), None);
        info.remote_urls = None;
        assert_eq!(info.package_filename(), None);
    }
}
