//! Ed25519 digital signatures for packet authentication.
//!
//! Buyers hold an Ed25519 key pair. The SDK signs the body of every server
//! init, server update and session update packet and appends the 64-byte
//! signature; the backend verifies it against the buyer's public key before
//! trusting any field other than the buyer id.
//!
//! ```text
//! +------------------------------+------------------+
//! | packet body (n bytes)        | signature (64)   |
//! +------------------------------+------------------+
//! ```

use crate::{CryptoError, ED25519_PUBLIC_KEY_SIZE, ED25519_SIGNATURE_SIZE};
use ed25519_dalek::{Signer, Verifier};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    fn to_dalek(self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

/// Ed25519 signing key (private key)
///
/// Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Generate a new random signing key
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Create from raw 32-byte seed
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.inner.sign(message);
        Signature(sig.to_bytes())
    }

    /// Get the corresponding verifying key (public key)
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Export signing key bytes
    ///
    /// # Security
    ///
    /// This exposes the raw secret key bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

/// Ed25519 verifying key (public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    /// Create from raw 32-byte public key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes do not
    /// represent a valid Ed25519 public key point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Create from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] on wrong length or invalid point.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; ED25519_PUBLIC_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Get the raw public key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Verify a signature on a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// authenticate the message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.inner
            .verify(message, &signature.to_dalek())
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// Append an Ed25519 signature over `body` and return the signed payload.
#[must_use]
pub fn sign_packet(key: &SigningKey, body: &[u8]) -> Vec<u8> {
    let signature = key.sign(body);
    let mut out = Vec::with_capacity(body.len() + ED25519_SIGNATURE_SIZE);
    out.extend_from_slice(body);
    out.extend_from_slice(signature.as_bytes());
    out
}

/// Verify a signed payload (`body ‖ signature`) against raw public key bytes.
///
/// Returns `false` for malformed keys, payloads too short to carry a
/// signature, or signature mismatch.
#[must_use]
pub fn verify_packet(public_key: &[u8], payload: &[u8]) -> bool {
    if payload.len() < ED25519_SIGNATURE_SIZE {
        return false;
    }

    let Ok(key) = VerifyingKey::from_slice(public_key) else {
        return false;
    };

    let (body, sig) = payload.split_at(payload.len() - ED25519_SIGNATURE_SIZE);
    match Signature::from_slice(sig) {
        Ok(signature) => key.verify(body, &signature).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let message = b"session update body";
        let signature = signing_key.sign(message);

        assert!(verifying_key.verify(message, &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails_verification() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let signature = signing_key.sign(b"original message");
        assert!(verifying_key.verify(b"tampered message", &signature).is_err());
    }

    #[test]
    fn test_signature_deterministic() {
        let signing_key = SigningKey::generate(&mut OsRng);
        assert_eq!(signing_key.sign(b"x"), signing_key.sign(b"x"));
    }

    #[test]
    fn test_sign_packet_appends_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = sign_packet(&key, b"body");
        assert_eq!(signed.len(), 4 + ED25519_SIGNATURE_SIZE);
        assert_eq!(&signed[..4], b"body");
    }

    #[test]
    fn test_verify_packet() {
        let key = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key().to_bytes();
        let signed = sign_packet(&key, b"server update");

        assert!(verify_packet(&public, &signed));

        let mut tampered = signed.clone();
        tampered[0] ^= 0xFF;
        assert!(!verify_packet(&public, &tampered));
    }

    #[test]
    fn test_verify_packet_rejects_short_and_bad_key() {
        let key = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key().to_bytes();

        assert!(!verify_packet(&public, &[0u8; 10]));
        assert!(!verify_packet(&public[..16], &sign_packet(&key, b"x")));
    }

    #[test]
    fn test_signature_from_slice() {
        assert!(Signature::from_slice(&[0u8; 64]).is_ok());
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
    }
}
