//! Package unpacking, promotion, and garbage collection.
//!
//! A verified package archive is extracted into a staging directory (with
//! path-escape defenses), verified as a tree, then promoted into a
//! versioned folder under the install root. The `current` pointer is
//! rewritten afterwards and obsolete versions are collected best-effort.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::version::VersionQuad;

/// Name of the current-version pointer file inside the install root.
pub const CURRENT_POINTER: &str = "current";

/// Extract a package archive into `staging`.
///
/// Members with absolute paths or a leading `..` are refused outright;
/// the joined target is additionally required to stay inside `staging`.
pub(crate) fn unpack_archive(archive_path: &Path, staging: &Path) -> Result<(), UpdateError> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        let name = member.name().to_string();

        if is_unsafe_member(&name) {
            return Err(UpdateError::PathUnsafe(name));
        }
        let rel = member
            .enclosed_name()
            .ok_or_else(|| UpdateError::PathUnsafe(name.clone()))?;
        let target = staging.join(rel);
        if !target.starts_with(staging) {
            return Err(UpdateError::PathUnsafe(name));
        }

        if member.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut member, &mut out)?;

        // Restore the execute bit so relaunching an installed version works.
        #[cfg(unix)]
        if let Some(mode) = member.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }

    debug!(archive = %archive_path.display(), staging = %staging.display(), "archive unpacked");
    Ok(())
}

/// Whether an archive member name must be refused before any path math.
pub(crate) fn is_unsafe_member(name: &str) -> bool {
    if name.starts_with('/') || name.starts_with('\\') {
        return true;
    }
    // Drive-letter or other scheme-ish absolute forms.
    if name.len() >= 2 && name.as_bytes()[1] == b':' {
        return true;
    }
    let lowered = name.to_ascii_lowercase();
    if lowered.starts_with("..") {
        return true;
    }
    lowered
        .split(['/', '\\'])
        .any(|segment| segment == "..")
}

/// Promote a verified staging tree to `<install_root>/<version>`.
///
/// An existing target folder is deleted first; promotion then copies the
/// staged tree and rewrites the `current` pointer.
pub(crate) fn promote(
    staging: &Path,
    install_root: &Path,
    version: VersionQuad,
) -> Result<PathBuf, UpdateError> {
    let target = install_root.join(version.to_string());
    if target.exists() {
        info!(target = %target.display(), "replacing existing install");
        std::fs::remove_dir_all(&target)?;
    }
    std::fs::create_dir_all(&target)?;
    copy_tree(staging, &target)?;
    write_current(install_root, version)?;

    info!(version = %version, target = %target.display(), "update promoted");
    Ok(target)
}

/// Recursively copy `src` into the existing directory `dst`.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), UpdateError> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            UpdateError::Filesystem(io::Error::other(format!("walk failed: {e}")))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| UpdateError::Filesystem(io::Error::other(e.to_string())))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rewrite the `current` pointer via a temp file and rename.
pub(crate) fn write_current(install_root: &Path, version: VersionQuad) -> Result<(), UpdateError> {
    let tmp = install_root.join("current.tmp");
    std::fs::write(&tmp, version.to_string())?;
    std::fs::rename(&tmp, install_root.join(CURRENT_POINTER))?;
    Ok(())
}

/// Read the `current` pointer, if present and non-blank.
pub(crate) fn read_current(install_root: &Path) -> Option<String> {
    let content = std::fs::read_to_string(install_root.join(CURRENT_POINTER)).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Delete obsolete version folders, best-effort.
///
/// The newest version always survives, and so does the newest *obsolete*
/// one (long-standing behavior, kept as a rollback escape hatch). The
/// folder named by `current` and the folder the running version occupies
/// are never deleted. Failures are logged and ignored.
pub(crate) fn collect_garbage(
    install_root: &Path,
    versions: &[(PathBuf, VersionQuad)],
    self_folder: Option<&Path>,
) {
    let mut sorted: Vec<&(PathBuf, VersionQuad)> = versions.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));

    let current_target = read_current(install_root).map(|v| install_root.join(v));

    // sorted[0] is the live best; sorted[1] is the retained obsolete one.
    for (folder, version) in sorted.iter().skip(2) {
        if Some(folder.as_path()) == current_target.as_deref() {
            continue;
        }
        if Some(folder.as_path()) == self_folder {
            continue;
        }
        match std::fs::remove_dir_all(folder) {
            Ok(()) => info!(version = %version, folder = %folder.display(), "removed obsolete install"),
            Err(e) => warn!(version = %version, error = %e, "failed to remove obsolete install"),
        }
    }
}
