//! Error types for the update runtime.

use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Network failure while fetching a manifest or package
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed JSON, ZIP, or signed-stream framing
    #[error("format error: {0}")]
    Format(String),

    /// RSA signature did not verify against the pinned public key
    #[error("signature verification failed")]
    SignatureInvalid,

    /// Stream ended before the declared signature was read
    #[error("signed stream truncated before signature")]
    Truncated,

    /// Downloaded package size or digest differs from the manifest
    #[error("integrity mismatch ({what}): expected {expected}, got {actual}")]
    IntegrityMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// Archive member would escape the extraction directory
    #[error("unsafe archive path: {0}")]
    PathUnsafe(String),

    /// Unpacked tree does not match its embedded manifest
    #[error("install verification failed: {0}")]
    VerificationFailed(String),

    /// Filesystem failure
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Failed to spawn or wait on the selected version
    #[error("launch error: {0}")]
    Launch(String),

    /// Invalid configuration (keys, URLs, strategy names)
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(err: serde_json::Error) -> Self {
        UpdateError::Format(err.to_string())
    }
}

impl From<zip::result::ZipError> for UpdateError {
    fn from(err: zip::result::ZipError) -> Self {
        UpdateError::Format(err.to_string())
    }
}

/// Process-wide listener for recovered errors.
///
/// Per-candidate failures (a bad mirror, a tampered manifest, an install
/// that fails verification) are reported here and then recovered locally;
/// no error delivered through this listener stops the supervisor loop.
pub type ErrorListener = Arc<dyn Fn(&UpdateError) + Send + Sync>;
