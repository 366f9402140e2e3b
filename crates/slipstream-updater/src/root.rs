//! Install root resolution.
//!
//! The install root is the writable directory holding every side-installed
//! update version, the `current` pointer, and the installation marker
//! files. Resolution probes an ordered candidate list: preferred locations
//! that must already exist, legacy locations that must exist and be
//! non-empty, then locations the resolver is willing to create. An
//! `AUTOUPDATER_<APP>_UPDATE_ROOT` environment variable bypasses all
//! probing.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::UpdaterConfig;
use crate::error::UpdateError;

/// Marker file describing the directory to curious users.
const README_FILE: &str = "README.txt";
/// Marker file whose first non-blank line is the installation id.
const INSTALLATION_FILE: &str = "installation.txt";

const README_TEXT: &str = "This directory is managed by the application's automatic updater.\n\
It holds downloaded update versions; each subdirectory is one installed\n\
version. Deleting a subdirectory removes that version. The 'current' file\n\
names the version launched by default.\n";

/// The resolved install root and its installation identity.
#[derive(Debug, Clone)]
pub struct InstallRoot {
    path: PathBuf,
    install_id: Option<String>,
}

impl InstallRoot {
    /// Resolve the install root for this configuration.
    ///
    /// `installed_base_dir` is the directory the application was
    /// originally installed into; it is read-only to the updater but
    /// anchors several candidates.
    pub fn resolve(
        config: &UpdaterConfig,
        installed_base_dir: &Path,
    ) -> Result<InstallRoot, UpdateError> {
        if let Ok(value) = std::env::var(config.env_var("UPDATE_ROOT")) {
            if !value.trim().is_empty() {
                let path = PathBuf::from(expand_env_vars(&value));
                debug!(path = %path.display(), "install root forced by environment");
                std::fs::create_dir_all(&path)?;
                return Ok(Self::open(path));
            }
        }

        let app = &config.app_name;

        for candidate in override_candidates(app, installed_base_dir) {
            if candidate.is_dir() && probe_writable(&candidate) {
                debug!(path = %candidate.display(), "install root from override list");
                return Ok(Self::open(candidate));
            }
        }

        for candidate in legacy_candidates(app) {
            if dir_has_entries(&candidate) && probe_writable(&candidate) {
                debug!(path = %candidate.display(), "install root from legacy list");
                return Ok(Self::open(candidate));
            }
        }

        for candidate in attempt_candidates(app, installed_base_dir) {
            if !candidate.exists() && std::fs::create_dir_all(&candidate).is_err() {
                continue;
            }
            if probe_writable(&candidate) {
                debug!(path = %candidate.display(), "install root created");
                return Ok(Self::open(candidate));
            }
        }

        Err(UpdateError::Config(
            "no writable install root candidate".to_string(),
        ))
    }

    /// Use an explicit directory as the install root, creating it if
    /// needed. Marker files are written on first use like in `resolve`.
    pub fn at(path: PathBuf) -> Result<InstallRoot, UpdateError> {
        std::fs::create_dir_all(&path)?;
        Ok(Self::open(path))
    }

    fn open(path: PathBuf) -> InstallRoot {
        ensure_marker_files(&path);
        let install_id = read_install_id(&path);
        InstallRoot { path, install_id }
    }

    /// The resolved directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The installation id: first non-blank line of `installation.txt`.
    pub fn install_id(&self) -> Option<&str> {
        self.install_id.as_deref()
    }
}

/// Preferred locations; used only if they already exist.
fn override_candidates(app: &str, installed_base_dir: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![installed_base_dir.join("updates")];
    candidates.extend(per_user_candidates(app));
    candidates
}

/// Platform per-user data locations.
fn per_user_candidates(app: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    #[cfg(target_os = "windows")]
    {
        if let Some(local) = env_path("LOCALAPPDATA") {
            candidates.push(local.join(app).join("updates"));
        }
        if let Some(roaming) = env_path("APPDATA") {
            candidates.push(roaming.join(app).join("updates"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = env_path("HOME") {
            candidates.push(
                home.join("Library")
                    .join("Application Support")
                    .join(app)
                    .join("updates"),
            );
        }
        if let Some(data) = unix_data_dir() {
            candidates.push(data.join(app).join("updates"));
        }
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        if let Some(data) = unix_data_dir() {
            candidates.push(data.join(app).join("updates"));
        }
    }

    candidates
}

/// Prior well-known locations; honored only when they already hold files.
fn legacy_candidates(app: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(pf) = env_path("PROGRAMFILES") {
        candidates.push(pf.join(app).join("updates"));
    }
    if let Some(local) = env_path("LOCALAPPDATA") {
        candidates.push(local.join(app).join("updates"));
    }
    candidates
}

/// Locations the resolver will create if probing reaches them.
fn attempt_candidates(app: &str, installed_base_dir: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    let under_program_files = env_path("PROGRAMFILES")
        .map(|pf| installed_base_dir.starts_with(&pf))
        .unwrap_or(false);
    if !under_program_files {
        candidates.push(installed_base_dir.join("updates"));
    }

    if let Some(system) = system_wide_dir(app) {
        candidates.push(system);
    }

    candidates.extend(per_user_candidates(app));
    candidates
}

/// The platform system-wide data location.
fn system_wide_dir(app: &str) -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        Some(
            PathBuf::from("/Library/Application Support")
                .join(app)
                .join("updates"),
        )
    }
    #[cfg(target_os = "windows")]
    {
        env_path("PROGRAMDATA").map(|p| p.join(app).join("updates"))
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        Some(PathBuf::from("/var/lib").join(app).join("updates"))
    }
}

#[cfg(all(unix, not(target_os = "windows")))]
fn unix_data_dir() -> Option<PathBuf> {
    if let Some(xdg) = env_path("XDG_DATA_HOME") {
        return Some(xdg);
    }
    env_path("HOME").map(|h| h.join(".local").join("share"))
}

fn env_path(name: &str) -> Option<PathBuf> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v)),
        _ => None,
    }
}

fn dir_has_entries(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

/// Test writability by creating and removing a probe subdirectory.
fn probe_writable(path: &Path) -> bool {
    let probe = path.join(format!("test-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));
    match std::fs::create_dir(&probe) {
        Ok(()) => {
            if let Err(e) = std::fs::remove_dir(&probe) {
                warn!(probe = %probe.display(), error = %e, "failed to remove write probe");
            }
            true
        }
        Err(_) => false,
    }
}

/// Write `README.txt` and `installation.txt` if missing.
fn ensure_marker_files(root: &Path) {
    let readme = root.join(README_FILE);
    if !readme.exists() {
        if let Err(e) = std::fs::write(&readme, README_TEXT) {
            warn!(error = %e, "failed to write README.txt");
        }
    }

    let installation = root.join(INSTALLATION_FILE);
    if !installation.exists() {
        let id: [u8; 16] = rand::random();
        let content = format!("{}\n", hex::encode(id));
        if let Err(e) = std::fs::write(&installation, content) {
            warn!(error = %e, "failed to write installation.txt");
        }
    }
}

fn read_install_id(root: &Path) -> Option<String> {
    let content = std::fs::read_to_string(root.join(INSTALLATION_FILE)).ok()?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Expand `$VAR`, `${VAR}`, and `%VAR%` references.
///
/// Unknown variables expand to the empty string, matching shell behavior.
pub(crate) fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '$' => {
                let mut name = String::new();
                if chars.peek() == Some(&'{') {
                    chars.next();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        name.push(c);
                    }
                } else {
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                if name.is_empty() {
                    out.push('$');
                } else {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                }
            }
            '%' => {
                let name: String = chars.clone().take_while(|&c| c != '%').collect();
                // Require a closing percent; otherwise the sign is literal.
                let consumed = name.chars().count();
                let mut lookahead = chars.clone();
                if lookahead.nth(consumed) == Some('%') && !name.is_empty() {
                    for _ in 0..=consumed {
                        chars.next();
                    }
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    out.push('%');
                }
            }
            other => out.push(other),
        }
    }

    out
}
