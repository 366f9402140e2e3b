//! Signed stream codec.
//!
//! Every manifest crosses a trust boundary wrapped in a length-delimited
//! RSA signature:
//!
//! ```text
//! [u32 signature length, big endian][signature bytes][payload bytes]
//! ```
//!
//! The signature is RSA PKCS#1 v1.5 over the SHA-1 digest of the payload.
//! SHA-1 here is dictated by compatibility with already-published
//! manifests; the codec must stay bit-exact and never silently upgrade
//! the algorithm.
//!
//! Reading goes through [`VerifyingReader`], which hashes the payload as
//! it streams and verifies the signature when the stream ends. A consumer
//! that processes bytes before end-of-stream must drain to EOF (or use
//! [`read_verified`]) before treating anything it saw as trusted.

use std::io::{self, Read, Write};

use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::error::UpdateError;

/// Upper bound on a plausible RSA signature, in bytes (8192-bit key).
const MAX_SIGNATURE_LEN: usize = 1024;

/// Read a payload from `input` and write its signed framing to `output`.
pub fn create_signed<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    key: &RsaPrivateKey,
) -> Result<(), UpdateError> {
    let mut payload = Vec::new();
    input.read_to_end(&mut payload)?;

    let digest: [u8; 20] = Sha1::digest(&payload).into();
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .map_err(|e| UpdateError::Config(format!("signing failed: {e}")))?;

    output.write_all(&(signature.len() as u32).to_be_bytes())?;
    output.write_all(&signature)?;
    output.write_all(&payload)?;
    Ok(())
}

/// Convenience form of [`create_signed`] for in-memory payloads.
pub fn sign_bytes(payload: &[u8], key: &RsaPrivateKey) -> Result<Vec<u8>, UpdateError> {
    let mut out = Vec::with_capacity(payload.len() + 260);
    create_signed(&mut io::Cursor::new(payload), &mut out, key)?;
    Ok(out)
}

/// Open a signed stream for verified reading.
///
/// Parses the length header and signature immediately; returns `Format`
/// if the header is absent or implausible and `Truncated` if the stream
/// ends before the declared signature bytes.
pub fn open_verifying<R: Read>(
    mut input: R,
    key: &RsaPublicKey,
) -> Result<VerifyingReader<R>, UpdateError> {
    let mut len_bytes = [0u8; 4];
    input
        .read_exact(&mut len_bytes)
        .map_err(|_| UpdateError::Format("missing signature header".to_string()))?;

    let sig_len = u32::from_be_bytes(len_bytes) as usize;
    if sig_len == 0 || sig_len > MAX_SIGNATURE_LEN {
        return Err(UpdateError::Format(format!(
            "implausible signature length {sig_len}"
        )));
    }

    let mut signature = vec![0u8; sig_len];
    input.read_exact(&mut signature).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            UpdateError::Truncated
        } else {
            UpdateError::Filesystem(e)
        }
    })?;

    Ok(VerifyingReader {
        inner: input,
        signature,
        key: key.clone(),
        hasher: Sha1::new(),
        state: State::Streaming,
    })
}

/// Drain a signed stream fully and return the verified payload.
pub fn read_verified<R: Read>(input: R, key: &RsaPublicKey) -> Result<Vec<u8>, UpdateError> {
    let mut reader = open_verifying(input, key)?;
    let mut payload = Vec::new();
    match reader.read_to_end(&mut payload) {
        Ok(_) => Ok(payload),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(UpdateError::SignatureInvalid),
        Err(e) => Err(UpdateError::Filesystem(e)),
    }
}

#[derive(Debug, PartialEq)]
enum State {
    Streaming,
    Verified,
    Failed,
}

/// Reader over the payload portion of a signed stream.
///
/// Bytes are hashed as they pass through. At end of stream the accumulated
/// digest is verified against the signature; a failed verification turns
/// the final read into an `InvalidData` error, so a consumer that drains
/// the stream can never mistake a tampered payload for a trusted one.
pub struct VerifyingReader<R> {
    inner: R,
    signature: Vec<u8>,
    key: RsaPublicKey,
    hasher: Sha1,
    state: State,
}

impl<R> VerifyingReader<R> {
    /// Whether the stream reached EOF with a valid signature.
    pub fn is_verified(&self) -> bool {
        self.state == State::Verified
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state {
            State::Verified => return Ok(0),
            State::Failed => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    UpdateError::SignatureInvalid.to_string(),
                ));
            }
            State::Streaming => {}
        }

        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            return Ok(n);
        }

        let digest: [u8; 20] = self.hasher.clone().finalize().into();
        match self
            .key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &self.signature)
        {
            Ok(()) => {
                self.state = State::Verified;
                Ok(0)
            }
            Err(_) => {
                self.state = State::Failed;
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    UpdateError::SignatureInvalid.to_string(),
                ))
            }
        }
    }
}
