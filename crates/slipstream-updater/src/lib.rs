//! # slipstream-updater
//!
//! Self-updating application runtime. The host application hands its real
//! entry point to the supervisor, which launches the best installed
//! version as a child process, keeps a managed directory of side-installed
//! updates, and coordinates background check/download work around the
//! running workload.
//!
//! This crate handles:
//! - Signed manifest transport (length-prefixed RSA signature framing)
//! - Update checks with channel and release-type policy
//! - Package download with size + SHA-256 + MD5 integrity gating
//! - Tamper-resistant unpacking and per-file install verification
//! - Installed-version cataloging and best-version selection
//! - The supervisor loop with the magic-exit-code relaunch contract
//! - Building signed update packages (the inverse of installation)
//!
//! ## Security
//!
//! A manifest only ever enters the system through the signed-stream codec:
//! an unsigned or tampered manifest is indistinguishable from "no
//! manifest". Packages are gated on size and two digests before
//! extraction, archive members are checked against path escapes, and an
//! unpacked tree must match its embedded manifest file-for-file before it
//! can be promoted or launched.

pub mod builder;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod download;
pub mod error;
pub mod fetch;
pub mod install;
pub mod manager;
pub mod manifest;
#[cfg(test)]
mod proptests;
pub mod root;
pub mod signed;
pub mod supervisor;
pub mod verify;
pub mod version;

// Re-export main types for convenience
pub use builder::build_package;
pub use catalog::{BestVersion, InstalledVersion};
pub use channel::ReleaseType;
pub use config::UpdaterConfig;
pub use download::{DownloadProgress, ProgressCallback};
pub use error::{ErrorListener, UpdateError};
pub use manager::UpdateManager;
pub use manifest::{FileEntry, UpdateInfo, MANIFEST_NAME};
pub use root::InstallRoot;
pub use signed::{create_signed, open_verifying, read_verified, sign_bytes, VerifyingReader};
pub use supervisor::{
    run_from_most_recent, Strategy, StrategyPlan, Supervisor, Timing, MAGIC_RELAUNCH_EXIT_CODE,
};
pub use version::VersionQuad;
