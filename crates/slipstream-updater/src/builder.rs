//! Package building: the inverse of the installer.
//!
//! Walks an application tree, produces a signed `package.zip` whose
//! embedded manifest records every file's digests, and writes the signed
//! remote manifest describing the archive next to it.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, MAIN_SEPARATOR};

use chrono::{DateTime, Utc};
use rsa::RsaPrivateKey;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::download::{digest_b64, dual_digest_reader};
use crate::error::UpdateError;
use crate::manifest::{FileEntry, UpdateInfo, MANIFEST_NAME};
use crate::signed;

/// Name of the produced archive inside the output folder.
pub const PACKAGE_NAME: &str = "package.zip";

/// Build a signed update package from `input_dir`.
///
/// `template` is the unsigned local manifest: release metadata plus the
/// ignore-entry list. Files under ignored paths and any pre-existing
/// manifest file are skipped; everything else is archived and recorded
/// with both digests. The signed embedded manifest goes into the archive,
/// then `package.zip` and a signed remote `autoupdate.manifest` are
/// written into `output_dir`. Returns the remote manifest.
pub fn build_package(
    input_dir: &Path,
    template: &UpdateInfo,
    output_dir: &Path,
    key: &RsaPrivateKey,
) -> Result<UpdateInfo, UpdateError> {
    std::fs::create_dir_all(output_dir)?;

    let mut local = template.clone();
    if local.release_time_unknown() {
        local.release_time = Utc::now();
    }

    let ignore_entries: Vec<FileEntry> = template
        .files
        .as_ref()
        .map(|files| files.iter().filter(|f| f.ignore).cloned().collect())
        .unwrap_or_default();

    let package_path = output_dir.join(PACKAGE_NAME);
    let mut writer = zip::ZipWriter::new(File::create(&package_path)?);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries: Vec<FileEntry> = Vec::new();
    let mut uncompressed_size = 0u64;

    let mut walker: Vec<_> = WalkDir::new(input_dir)
        .into_iter()
        .collect::<Result<_, _>>()
        .map_err(|e| UpdateError::Filesystem(io::Error::other(format!("walk failed: {e}"))))?;
    walker.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in walker {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(input_dir)
            .map_err(|e| UpdateError::Filesystem(io::Error::other(e.to_string())))?;
        let rel_name = archive_name(rel);

        if rel_name == MANIFEST_NAME || is_ignored(&rel_name, &ignore_entries) {
            debug!(path = %rel_name, "skipping");
            continue;
        }

        let mut file = File::open(entry.path())?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let (sha256, md5) = {
            let mut cursor = io::Cursor::new(&contents);
            dual_digest_reader(&mut cursor)?
        };

        // Record the source mode so execute bits survive unpacking.
        #[allow(unused_mut)]
        let mut member_options = options;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(entry.path())?.permissions().mode();
            member_options = member_options.unix_permissions(mode);
        }

        writer.start_file(rel_name.as_str(), member_options)?;
        writer.write_all(&contents)?;
        uncompressed_size += contents.len() as u64;

        entries.push(FileEntry {
            path: rel_name,
            ignore: false,
            last_write_time: file_mtime(entry.path()),
            sha256: Some(digest_b64(&sha256)),
            md5: Some(digest_b64(&md5)),
        });
    }

    entries.extend(ignore_entries);

    local.files = Some(entries);
    local.remote_urls = None;
    local.uncompressed_size = uncompressed_size;
    local.compressed_size = 0;
    local.sha256 = None;
    local.md5 = None;

    let embedded = signed::sign_bytes(&serde_json::to_vec(&local)?, key)?;
    writer.start_file(MANIFEST_NAME, options)?;
    writer.write_all(&embedded)?;
    writer.finish()?;

    // Describe the finished archive in the remote manifest.
    let (zip_sha256, zip_md5) = crate::download::dual_digest_file(&package_path)?;
    let mut remote = local.clone();
    remote.files = None;
    remote.uncompressed_size = 0;
    remote.compressed_size = std::fs::metadata(&package_path)?.len();
    remote.sha256 = Some(digest_b64(&zip_sha256));
    remote.md5 = Some(digest_b64(&zip_md5));
    remote.remote_urls = template.remote_urls.clone();

    let remote_signed = signed::sign_bytes(&serde_json::to_vec(&remote)?, key)?;
    std::fs::write(output_dir.join(MANIFEST_NAME), remote_signed)?;

    info!(
        package = %package_path.display(),
        size = remote.compressed_size,
        version = %remote.parsed_version(),
        "package built"
    );
    Ok(remote)
}

/// Forward-slash relative name for an archive member.
fn archive_name(rel: &Path) -> String {
    rel.to_string_lossy().replace(MAIN_SEPARATOR, "/")
}

/// Whether a relative name matches an ignore entry or sits under an
/// ignored directory.
fn is_ignored(rel_name: &str, ignore_entries: &[FileEntry]) -> bool {
    ignore_entries.iter().any(|entry| {
        if entry.is_directory() {
            rel_name.starts_with(&entry.path)
        } else {
            rel_name == entry.path
        }
    })
}

fn file_mtime(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::UNIX_EPOCH)
}
