//! Installed-version catalog.
//!
//! Scans the install root for versioned folders, each carrying a signed
//! embedded manifest, and reads individual installed manifests. Selection
//! among the catalog entries lives on the manager, which layers
//! verification and caching on top of the raw scan.

use std::path::{Path, PathBuf};

use rsa::RsaPublicKey;
use tracing::{debug, warn};

use crate::error::UpdateError;
use crate::manifest::{UpdateInfo, MANIFEST_NAME};
use crate::signed;
use crate::version::VersionQuad;

/// One installed update: a version folder and its embedded manifest.
#[derive(Debug, Clone)]
pub struct InstalledVersion {
    /// Absolute folder the version is unpacked into.
    pub folder: PathBuf,
    /// The embedded manifest read from the folder.
    pub manifest: UpdateInfo,
}

impl InstalledVersion {
    /// The folder's version under the parse policy.
    pub fn version(&self) -> VersionQuad {
        self.manifest.parsed_version()
    }
}

/// The version chosen to run.
#[derive(Debug, Clone)]
pub struct BestVersion {
    /// Folder holding the executable tree.
    pub folder: PathBuf,
    /// Parsed version of that tree.
    pub version: VersionQuad,
    /// Embedded manifest, absent for the baseline in-place install.
    pub manifest: Option<UpdateInfo>,
}

/// Read the signed embedded manifest of an installed folder.
///
/// A missing manifest file is the normal "not an install" answer and
/// returns `Ok(None)`; an unreadable, unsigned, or tampered manifest is
/// an error for the caller to report.
pub(crate) fn read_installed_manifest(
    folder: &Path,
    key: &RsaPublicKey,
) -> Result<Option<UpdateInfo>, UpdateError> {
    let path = folder.join(MANIFEST_NAME);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let payload = signed::read_verified(std::io::Cursor::new(&bytes), key)?;
    let manifest: UpdateInfo = serde_json::from_slice(&payload)?;
    Ok(Some(manifest))
}

/// Scan the install root for installed versions.
///
/// Folders without a manifest are silently ignored; folders whose manifest
/// is unreadable, unsigned, or tampered are reported through `on_error`
/// and skipped. The scan itself never fails.
pub(crate) fn scan_installed(
    install_root: &Path,
    key: &RsaPublicKey,
    on_error: &dyn Fn(&UpdateError),
) -> Vec<InstalledVersion> {
    let mut found = Vec::new();

    let entries = match std::fs::read_dir(install_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %install_root.display(), error = %e, "cannot scan install root");
            on_error(&e.into());
            return found;
        }
    };

    for entry in entries.flatten() {
        let folder = entry.path();
        if !folder.is_dir() {
            continue;
        }
        match read_installed_manifest(&folder, key) {
            Ok(Some(manifest)) => {
                debug!(
                    folder = %folder.display(),
                    version = %manifest.parsed_version(),
                    "found installed version"
                );
                found.push(InstalledVersion { folder, manifest });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(folder = %folder.display(), error = %e, "skipping unreadable install");
                on_error(&e);
            }
        }
    }

    found
}
