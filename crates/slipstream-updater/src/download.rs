//! Package download and integrity gating.
//!
//! Downloads the package archive named by a remote manifest into a temp
//! file, reporting progress, and gates the completed file on size, then
//! SHA-256, then MD5 before anything is allowed to unpack it.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use md5::Md5;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::manifest::UpdateInfo;

/// Connection timeout for package and manifest requests, in seconds.
pub(crate) const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Buffer size for streaming downloads and hashing.
const IO_BUFFER_SIZE: usize = 8192;

/// Progress callback type for download progress reporting.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes expected, per the manifest.
    pub total: u64,
}

impl DownloadProgress {
    /// Completed fraction, clamped to `[0.0, 1.0]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.downloaded as f64 / self.total as f64).clamp(0.0, 1.0)
    }

    /// Whether the expected byte count has arrived.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.downloaded >= self.total
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} bytes ({:.1}%)",
            self.downloaded,
            self.total,
            self.fraction() * 100.0
        )
    }
}

/// Build the blocking HTTP client shared by manifest and package fetches.
pub(crate) fn build_client(user_agent: &str) -> Result<reqwest::blocking::Client, UpdateError> {
    reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        // Package downloads can be long; only the connection phase is bounded.
        .timeout(None)
        .user_agent(user_agent)
        .build()
        .map_err(UpdateError::from)
}

/// Compose the candidate download URLs for an update.
///
/// Alternate mirrors are tried first: each has its last path segment
/// replaced by the package file name from the primary remote URL. The
/// manifest's own remote URLs follow in their original order.
pub(crate) fn candidate_urls(update: &UpdateInfo, alternates: &[String]) -> Vec<String> {
    let mut candidates = Vec::new();

    if let Some(filename) = update.package_filename() {
        for mirror in alternates {
            if let Some(url) = swap_last_segment(mirror, filename) {
                candidates.push(url);
            }
        }
    }

    if let Some(urls) = &update.remote_urls {
        candidates.extend(urls.iter().cloned());
    }

    candidates
}

/// Replace the last path segment of a URL with `filename`.
fn swap_last_segment(url: &str, filename: &str) -> Option<String> {
    let slash = url.rfind('/')?;
    // Refuse to clobber the scheme separator of a bare "https://host".
    if url[..slash].ends_with('/') || url[..slash].ends_with(':') {
        return Some(format!("{}/{}", url.trim_end_matches('/'), filename));
    }
    Some(format!("{}/{}", &url[..slash], filename))
}

/// Download `url` into a fresh temp file under `dir`.
///
/// Progress is reported as `downloaded / expected_size`, clamped; the
/// fraction never exceeds 1.0 even when a server lies about sizes.
pub(crate) fn download_to_temp(
    client: &reqwest::blocking::Client,
    url: &str,
    expected_size: u64,
    dir: &Path,
    progress: Option<&ProgressCallback>,
) -> Result<tempfile::NamedTempFile, UpdateError> {
    info!(url, expected_size, "downloading package");

    let mut response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(UpdateError::Transport(format!(
            "GET {url} returned status {}",
            response.status()
        )));
    }

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    let mut buffer = [0u8; IO_BUFFER_SIZE];
    let mut downloaded = 0u64;

    loop {
        let n = response
            .read(&mut buffer)
            .map_err(|e| UpdateError::Transport(e.to_string()))?;
        if n == 0 {
            break;
        }
        temp.write_all(&buffer[..n])?;
        downloaded += n as u64;
        if let Some(callback) = progress {
            callback(DownloadProgress {
                downloaded,
                total: expected_size,
            });
        }
    }
    temp.flush()?;

    debug!(downloaded, "download complete");
    Ok(temp)
}

/// Verify a downloaded package against its remote manifest.
///
/// Size first (cheap), then SHA-256, then MD5. Digest comparison is
/// constant-time over the raw digest bytes.
pub(crate) fn verify_package(path: &Path, update: &UpdateInfo) -> Result<(), UpdateError> {
    let actual_size = std::fs::metadata(path)?.len();
    if actual_size != update.compressed_size {
        return Err(UpdateError::IntegrityMismatch {
            what: "size",
            expected: update.compressed_size.to_string(),
            actual: actual_size.to_string(),
        });
    }

    let (sha256, md5) = dual_digest_file(path)?;

    let expected_sha = update
        .sha256
        .as_deref()
        .ok_or_else(|| UpdateError::Format("remote manifest missing SHA256".to_string()))?;
    compare_digest("sha256", expected_sha, &sha256)?;

    let expected_md5 = update
        .md5
        .as_deref()
        .ok_or_else(|| UpdateError::Format("remote manifest missing MD5".to_string()))?;
    compare_digest("md5", expected_md5, &md5)?;

    debug!(path = %path.display(), "package integrity verified");
    Ok(())
}

fn compare_digest(what: &'static str, expected_b64: &str, actual: &[u8]) -> Result<(), UpdateError> {
    let expected = B64
        .decode(expected_b64)
        .map_err(|e| UpdateError::Format(format!("invalid {what} digest encoding: {e}")))?;

    if expected.ct_eq(actual).unwrap_u8() != 1 {
        warn!(
            what,
            expected = expected_b64,
            actual = %B64.encode(actual),
            "digest mismatch"
        );
        return Err(UpdateError::IntegrityMismatch {
            what,
            expected: expected_b64.to_string(),
            actual: B64.encode(actual),
        });
    }
    Ok(())
}

/// SHA-256 and MD5 of a file's contents, in one pass.
pub(crate) fn dual_digest_file(path: &Path) -> Result<(Vec<u8>, Vec<u8>), UpdateError> {
    let mut file = File::open(path)?;
    dual_digest_reader(&mut file)
}

/// SHA-256 and MD5 of everything remaining in a reader.
pub(crate) fn dual_digest_reader<R: Read>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>), UpdateError> {
    let mut sha = Sha256::new();
    let mut md5 = Md5::new();
    let mut buffer = [0u8; IO_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        sha.update(&buffer[..n]);
        md5.update(&buffer[..n]);
    }

    let sha: [u8; 32] = sha.finalize().into();
    let md5: [u8; 16] = md5.finalize().into();
    Ok((sha.to_vec(), md5.to_vec()))
}

/// Base64 (standard alphabet, padded) of a raw digest.
pub(crate) fn digest_b64(digest: &[u8]) -> String {
    B64.encode(digest)
}
