//! Keyed-hash signatures for change notifications.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::errors::{IngestError, IngestResult};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer/verifier over raw notification bytes.
///
/// Signatures are lowercase hex. Comparison is exact (case-sensitive) and
/// constant-time.
#[derive(Clone)]
pub struct SignatureVerifier {
    mac: HmacSha256,
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> IngestResult<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| IngestError::authentication(format!("invalid secret: {}", e)))?;
        Ok(Self { mac })
    }

    /// Signature the change source is expected to send for `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        format!("{:x}", mac.finalize().into_bytes())
    }

    /// Check a provided signature against the body.
    pub fn verify(&self, body: &[u8], provided: &str) -> bool {
        let expected = self.sign(body);
        expected.as_bytes().ct_eq(provided.as_bytes()).into()
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}
