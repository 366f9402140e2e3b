//! Update manager: the process-wide update context.
//!
//! One `UpdateManager` is constructed at startup and threaded through
//! every operation. It owns the configuration, the resolved install root,
//! the HTTP client, the pinned public key, the error listener, and the
//! cached best-version lookup; the check / download / install / select
//! operations are its methods.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rsa::RsaPublicKey;
use tracing::{debug, info};

use crate::catalog::{self, BestVersion};
use crate::channel::ReleaseType;
use crate::config::UpdaterConfig;
use crate::download::{self, ProgressCallback};
use crate::error::{ErrorListener, UpdateError};
use crate::fetch;
use crate::install;
use crate::manifest::UpdateInfo;
use crate::root::InstallRoot;
use crate::verify;

/// Orchestrates update checking, installation, and version selection.
pub struct UpdateManager {
    config: UpdaterConfig,
    installed_base_dir: PathBuf,
    install_root: InstallRoot,
    client: reqwest::blocking::Client,
    public_key: RsaPublicKey,
    error_listener: Option<ErrorListener>,
    progress: Option<ProgressCallback>,
    last_check: Mutex<Option<UpdateInfo>>,
    best_cache: Mutex<Option<BestVersion>>,
}

impl UpdateManager {
    /// Create a manager, resolving the install root.
    ///
    /// `installed_base_dir` is the original application directory; it is
    /// never written, only used as the baseline version and as an anchor
    /// for install-root candidates.
    pub fn new(config: UpdaterConfig, installed_base_dir: PathBuf) -> Result<Self, UpdateError> {
        let public_key = config.public_key()?;
        let install_root = InstallRoot::resolve(&config, &installed_base_dir)?;
        let user_agent = fetch::user_agent(&config, install_root.install_id());
        let client = download::build_client(&user_agent)?;

        Ok(Self {
            config,
            installed_base_dir,
            install_root,
            client,
            public_key,
            error_listener: None,
            progress: None,
            last_check: Mutex::new(None),
            best_cache: Mutex::new(None),
        })
    }

    /// Install the process-wide error listener.
    pub fn set_error_listener(&mut self, listener: ErrorListener) {
        self.error_listener = Some(listener);
    }

    /// Install a download progress callback.
    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// The resolved install root directory.
    pub fn install_root(&self) -> &Path {
        self.install_root.path()
    }

    /// The original application directory.
    pub fn installed_base_dir(&self) -> &Path {
        &self.installed_base_dir
    }

    /// The installation id sent with update checks.
    pub fn install_id(&self) -> Option<&str> {
        self.install_root.install_id()
    }

    /// The result of the most recent successful update check.
    pub fn last_check_result(&self) -> Option<UpdateInfo> {
        self.last_check.lock().unwrap().clone()
    }

    /// Report a recovered error to the listener and the log.
    pub(crate) fn report(&self, err: &UpdateError) {
        tracing::error!(error = %err, "update error");
        if let Some(listener) = &self.error_listener {
            listener(err);
        }
    }

    /// Check the configured manifest URLs for an applicable update.
    ///
    /// The first URL that yields a verified manifest decides: the policy
    /// verdict on that manifest is final. URL failures (transport,
    /// signature, parse) are reported and the next candidate is tried.
    /// `None` is the normal "no update" answer.
    pub fn check_for_update(&self, channel: ReleaseType) -> Option<UpdateInfo> {
        let channel = if channel == ReleaseType::Unknown {
            self.config.default_channel
        } else {
            channel
        };

        for url in &self.config.manifest_urls {
            let url = fetch::substitute_channel(url, channel);
            match fetch::fetch_manifest(&self.client, &url, self.install_id(), &self.public_key) {
                Ok(manifest) => {
                    if fetch::accepts_update(&self.config, channel, &manifest) {
                        info!(version = %manifest.parsed_version(), "update available");
                        *self.last_check.lock().unwrap() = Some(manifest.clone());
                        return Some(manifest);
                    }
                    return None;
                }
                Err(e) => {
                    self.report(&e);
                    continue;
                }
            }
        }
        None
    }

    /// Download, verify, unpack, and promote an update.
    ///
    /// Candidate URLs (alternate mirrors first) are tried until one yields
    /// a package that passes every gate; each failed candidate is reported
    /// and the next is tried. Returns `true` on the first successful
    /// promote. A rejected candidate never leaves anything under the
    /// versioned install folder.
    pub fn download_and_unpack(&self, update: &UpdateInfo) -> bool {
        let candidates = download::candidate_urls(update, &self.config.alternate_package_urls);
        if candidates.is_empty() {
            self.report(&UpdateError::Config(
                "manifest carries no download URLs".to_string(),
            ));
            return false;
        }

        for url in &candidates {
            match self.try_install_from(url, update) {
                Ok(()) => return true,
                Err(e) => {
                    self.report(&e);
                    continue;
                }
            }
        }
        false
    }

    fn try_install_from(&self, url: &str, update: &UpdateInfo) -> Result<(), UpdateError> {
        let package = download::download_to_temp(
            &self.client,
            url,
            update.compressed_size,
            self.install_root(),
            self.progress.as_ref(),
        )?;
        download::verify_package(package.path(), update)?;
        self.install_from_file(package.path(), update)
    }

    /// Install an already-downloaded package file.
    ///
    /// The file must still pass the archive gates: members are extracted
    /// into a staging directory with path-escape defenses, the staged
    /// tree is verified against its embedded manifest, and only then is
    /// it promoted. Useful for side-loading a package obtained out of
    /// band; `download_and_unpack` lands here after its integrity gate.
    pub fn install_from_file(
        &self,
        archive: &Path,
        update: &UpdateInfo,
    ) -> Result<(), UpdateError> {
        let staging = tempfile::Builder::new()
            .prefix("staging-")
            .tempdir_in(self.install_root())?;

        install::unpack_archive(archive, staging.path())?;
        verify::verify_unpacked_tree(
            staging.path(),
            Some(update),
            &self.public_key,
            self.config.ignore_webroot,
        )?;

        let version = update.parsed_version();
        install::promote(staging.path(), self.install_root(), version)?;
        self.invalidate_cache();
        self.collect_garbage();
        Ok(())
    }

    /// Delete obsolete installed versions, best-effort.
    fn collect_garbage(&self) {
        let versions: Vec<(PathBuf, crate::version::VersionQuad)> =
            catalog::scan_installed(self.install_root(), &self.public_key, &|e| self.report(e))
                .into_iter()
                .map(|v| {
                    let version = v.version();
                    (v.folder, version)
                })
                .collect();

        let running = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .filter(|dir| dir.starts_with(self.install_root()));

        install::collect_garbage(self.install_root(), &versions, running.as_deref());
    }

    /// Validate an unpacked install directory against its embedded
    /// manifest. Errors are reported and collapse to `false`.
    pub fn verify_unpacked(&self, folder: &Path, expected: Option<&UpdateInfo>) -> bool {
        match verify::verify_unpacked_tree(
            folder,
            expected,
            &self.public_key,
            self.config.ignore_webroot,
        ) {
            Ok(()) => true,
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    /// Read the signed manifest of an installed folder.
    ///
    /// Missing manifests are the quiet "not an install" answer; signature
    /// and parse failures are reported.
    pub fn read_installed_manifest(&self, folder: &Path) -> Option<UpdateInfo> {
        match catalog::read_installed_manifest(folder, &self.public_key) {
            Ok(result) => result,
            Err(e) => {
                self.report(&e);
                None
            }
        }
    }

    /// Drop the cached best-version lookup.
    pub fn invalidate_cache(&self) {
        *self.best_cache.lock().unwrap() = None;
    }

    /// Choose the version to run.
    ///
    /// Starts from the baseline in-place install, adopts the highest
    /// installed update that verifies, then lets the `current` pointer
    /// override if it names something even newer that verifies. The
    /// result never has a version below the baseline. Cached until a
    /// promote or `force_recheck`.
    pub fn get_best_version(&self, force_recheck: bool) -> BestVersion {
        if force_recheck {
            self.invalidate_cache();
        }
        if let Some(cached) = self.best_cache.lock().unwrap().clone() {
            return cached;
        }

        let mut best = BestVersion {
            folder: self.installed_base_dir.clone(),
            version: self.config.parsed_self_version(),
            manifest: None,
        };

        // Highest verified installed update wins. Unreadable folders are
        // reported by the scan and passed over.
        let mut installed =
            catalog::scan_installed(self.install_root(), &self.public_key, &|e| self.report(e));
        installed.sort_by(|a, b| b.version().cmp(&a.version()));
        for candidate in installed {
            if candidate.version() <= best.version {
                break;
            }
            if self.verify_unpacked(&candidate.folder, None) {
                debug!(
                    folder = %candidate.folder.display(),
                    version = %candidate.version(),
                    "adopting installed update"
                );
                best = BestVersion {
                    folder: candidate.folder.clone(),
                    version: candidate.version(),
                    manifest: Some(candidate.manifest),
                };
                break;
            }
        }

        // The current pointer may name a version the scan has not seen
        // (a promote that raced this process); it still has to verify.
        if let Some(name) = install::read_current(self.install_root()) {
            let folder = self.install_root().join(&name);
            if folder != best.folder {
                if let Some(manifest) = self.read_installed_manifest(&folder) {
                    let version = manifest.parsed_version();
                    if version > best.version && self.verify_unpacked(&folder, None) {
                        debug!(folder = %folder.display(), version = %version, "adopting current pointer");
                        best = BestVersion {
                            folder,
                            version,
                            manifest: Some(manifest),
                        };
                    }
                }
            }
        }

        info!(folder = %best.folder.display(), version = %best.version, "best version selected");
        *self.best_cache.lock().unwrap() = Some(best.clone());
        best
    }

    /// Whether an installed update currently beats the baseline.
    pub fn has_update_installed(&self) -> bool {
        self.get_best_version(false).folder != self.installed_base_dir
    }
}
