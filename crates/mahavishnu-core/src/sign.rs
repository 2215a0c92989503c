//! Sign/verify capability consumed by the gateway to authenticate
//! subscription handshakes and signed event payloads.
//!
//! The core never hardcodes a key or a key-management scheme: callers
//! inject an implementation of [`SignVerify`] at construction time. The
//! HMAC-SHA256 implementation here is provided as the default, grounded
//! in the same hex-encoded HMAC shape used elsewhere in the ecosystem,
//! but nothing downstream depends on it concretely.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised by a [`SignVerify`] implementation.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum SignError {
    #[error("signing key must not be empty")]
    EmptyKey,

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("malformed signature: {0}")]
    MalformedSignature(String),
}

/// A capability for signing and verifying opaque byte payloads. Object-safe
/// so it can be shared behind an `Arc<dyn SignVerify>` across the gateway's
/// connection handlers.
pub trait SignVerify: Send + Sync {
    /// Produce a hex-encoded signature over `message`.
    fn sign(&self, message: &[u8]) -> Result<String, SignError>;

    /// Verify that `signature` (hex-encoded) matches `message`.
    fn verify(&self, message: &[u8], signature: &str) -> Result<(), SignError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn SignVerify) {}
};

/// HMAC-SHA256 signer/verifier over a fixed shared secret.
pub struct HmacSignVerify {
    key: Vec<u8>,
}

impl HmacSignVerify {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, SignError> {
        let key = key.into();
        if key.is_empty() {
            return Err(SignError::EmptyKey);
        }
        Ok(Self { key })
    }

    fn mac(&self) -> HmacSha256 {
        // key length is checked in `new`; `Hmac::new_from_slice` accepts
        // any non-empty length, so this cannot fail here.
        HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length")
    }
}

impl SignVerify for HmacSignVerify {
    fn sign(&self, message: &[u8]) -> Result<String, SignError> {
        let mut mac = self.mac();
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, message: &[u8], signature: &str) -> Result<(), SignError> {
        let expected =
            hex::decode(signature).map_err(|e| SignError::MalformedSignature(e.to_string()))?;
        let mut mac = self.mac();
        mac.update(message);
        mac.verify_slice(&expected)
            .map_err(|_| SignError::VerificationFailed)
    }
}

/// A signer that accepts every signature. Useful for local development and
/// for tests exercising code paths that require a `SignVerify` capability
/// without caring about its authenticity guarantees.
pub struct NullSignVerify;

impl SignVerify for NullSignVerify {
    fn sign(&self, _message: &[u8]) -> Result<String, SignError> {
        Ok(String::new())
    }

    fn verify(&self, _message: &[u8], _signature: &str) -> Result<(), SignError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_roundtrips() {
        let signer = HmacSignVerify::new(b"super-secret-key".to_vec()).unwrap();
        let sig = signer.sign(b"hello world").unwrap();
        assert!(signer.verify(b"hello world", &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let signer = HmacSignVerify::new(b"super-secret-key".to_vec()).unwrap();
        let sig = signer.sign(b"hello world").unwrap();
        assert_eq!(
            signer.verify(b"goodbye world", &sig),
            Err(SignError::VerificationFailed)
        );
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(HmacSignVerify::new(Vec::new()).unwrap_err(), SignError::EmptyKey);
    }

    #[test]
    fn malformed_signature_is_rejected() {
        let signer = HmacSignVerify::new(b"super-secret-key".to_vec()).unwrap();
        assert!(matches!(
            signer.verify(b"hello world", "not-hex"),
            Err(SignError::MalformedSignature(_))
        ));
    }

    #[test]
    fn null_sign_verify_accepts_everything() {
        let signer = NullSignVerify;
        assert!(signer.verify(b"anything", "garbage").is_ok());
    }
}
