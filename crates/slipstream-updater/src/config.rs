//! Updater configuration.
//!
//! Compiled-in or TOML-loaded settings for the update runtime: product
//! identity, channel defaults, manifest and mirror URLs, and the pinned
//! RSA public key manifests are verified against.

use std::path::Path;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use crate::channel::ReleaseType;
use crate::error::UpdateError;
use crate::version::VersionQuad;

/// Configuration for the update runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Product name; also the `<APP>` part of the environment variables
    #[serde(default)]
    pub app_name: String,

    /// Version of the running build
    #[serde(default)]
    pub self_version: String,

    /// Release track of the running build
    #[serde(default)]
    pub self_release_type: ReleaseType,

    /// Channel used when a check is requested with `Unknown`
    #[serde(default)]
    pub default_channel: ReleaseType,

    /// Candidate manifest URLs, tried in order
    #[serde(default)]
    pub manifest_urls: Vec<String>,

    /// Alternate package mirrors; their last path segment is replaced by
    /// the package file name and they are tried before the manifest's own
    /// remote URLs
    #[serde(default)]
    pub alternate_package_urls: Vec<String>,

    /// Pinned RSA public key (PEM) for manifest verification
    #[serde(default)]
    pub public_key_pem: String,

    /// Tolerate arbitrary content under `webroot/` during verification
    #[serde(default)]
    pub ignore_webroot: bool,

    /// Delay before a `*During` background check starts, in seconds
    #[serde(default = "default_during_delay")]
    pub during_delay_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            self_version: String::new(),
            self_release_type: ReleaseType::Stable,
            default_channel: ReleaseType::Stable,
            manifest_urls: Vec::new(),
            alternate_package_urls: Vec::new(),
            public_key_pem: String::new(),
            ignore_webroot: false,
            during_delay_secs: default_during_delay(),
        }
    }
}

fn default_during_delay() -> u64 {
    10
}

impl UpdaterConfig {
    /// Create a configuration for an application name and build version.
    pub fn for_app(app_name: &str, self_version: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            self_version: self_version.to_string(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The running build's version under the parse policy.
    pub fn parsed_self_version(&self) -> VersionQuad {
        VersionQuad::parse(&self.self_version)
    }

    /// Parse the pinned public key.
    ///
    /// Accepts both SPKI ("BEGIN PUBLIC KEY") and PKCS#1
    /// ("BEGIN RSA PUBLIC KEY") PEM encodings.
    pub fn public_key(&self) -> Result<RsaPublicKey, UpdateError> {
        if self.public_key_pem.trim().is_empty() {
            return Err(UpdateError::Config(
                "no manifest public key configured".to_string(),
            ));
        }
        RsaPublicKey::from_public_key_pem(&self.public_key_pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&self.public_key_pem))
            .map_err(|e| UpdateError::Config(format!("invalid manifest public key: {e}")))
    }

    /// Name of an `AUTOUPDATER_<APP>_<suffix>` environment variable.
    ///
    /// The app name is uppercased with every non-alphanumeric run
    /// collapsed to `_`, so "My App" becomes `AUTOUPDATER_MY_APP_POLICY`.
    pub fn env_var(&self, suffix: &str) -> String {
        let mut app = String::with_capacity(self.app_name.len());
        let mut last_was_sep = false;
        for c in self.app_name.chars() {
            if c.is_ascii_alphanumeric() {
                app.push(c.to_ascii_uppercase());
                last_was_sep = false;
            } else if !last_was_sep && !app.is_empty() {
                app.push('_');
                last_was_sep = true;
            }
        }
        let app = app.trim_end_matches('_');
        format!("AUTOUPDATER_{app}_{suffix}")
    }
}
