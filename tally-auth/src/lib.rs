//! Payload signing for Tally.
//!
//! Agent and server share a secret key. The agent signs the exact bytes it puts on the wire (the
//! gzip-compressed payload) with HMAC-SHA256 and transmits the hex digest in the
//! [`SIGNATURE_HEADER`]. The server recomputes the digest over the raw request body and compares
//! in constant time.
//!
//! ```
//! use tally_auth::SharedKey;
//!
//! let key = SharedKey::new("secret").unwrap();
//! let signature = key.sign(b"payload");
//!
//! assert!(key.verify(b"payload", signature.as_str()).is_ok());
//! assert!(key.verify(b"tampered", signature.as_str()).is_err());
//! ```

#![warn(missing_docs)]

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Name of the HTTP header carrying the hex encoded signature.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// Raised if a signature does not match its payload.
#[derive(Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum VerifyError {
    /// No signature was supplied although a key is configured.
    #[error("missing signature")]
    MissingSignature,
    /// The signature is not valid hex.
    #[error("bad signature encoding")]
    BadEncoding,
    /// The signature does not match the payload.
    #[error("invalid signature on data")]
    BadSignature,
}

/// A hex encoded HMAC-SHA256 digest.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Signature(String);

impl Signature {
    /// Returns the hex representation of the signature.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the raw digest bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VerifyError> {
        hex::decode(&self.0).map_err(|_| VerifyError::BadEncoding)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Signature {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VerifyError::MissingSignature);
        }

        hex::decode(s).map_err(|_| VerifyError::BadEncoding)?;
        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// A pre-shared secret used to sign and verify payloads.
///
/// An empty key disables signing, which is why [`SharedKey::new`] returns an `Option`.
#[derive(Clone, Eq, PartialEq)]
pub struct SharedKey(Vec<u8>);

impl SharedKey {
    /// Creates a key from its secret, returning `None` for an empty secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Option<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            None
        } else {
            Some(Self(secret.to_vec()))
        }
    }

    fn mac(&self) -> Hmac<Sha256> {
        Hmac::new_from_slice(&self.0).expect("HMAC takes variable keys")
    }

    /// Signs the given bytes.
    pub fn sign(&self, data: &[u8]) -> Signature {
        let mut mac = self.mac();
        mac.update(data);
        Signature(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verifies a hex encoded signature against the given bytes.
    ///
    /// The comparison runs in constant time. Any malformed signature is rejected.
    pub fn verify(&self, data: &[u8], signature: &str) -> Result<(), VerifyError> {
        let code = signature.parse::<Signature>()?.to_bytes()?;

        let mut mac = self.mac();
        mac.update(data);
        mac.verify_slice(&code)
            .map_err(|_| VerifyError::BadSignature)
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedKey").field(&"[redacted]").finish()
    }
}
