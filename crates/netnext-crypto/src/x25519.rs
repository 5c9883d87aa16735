//! X25519 Diffie-Hellman key agreement (RFC 7748).
//!
//! Route tokens are sealed per hop: the router private key is combined with
//! the hop's public key, so only that hop can open its token.
//!
//! Provides:
//! - Low-order point rejection
//! - Automatic key clamping (RFC 7748)
//! - Zeroization of sensitive data

use crate::{CryptoError, X25519_PUBLIC_KEY_SIZE};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 private key (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// X25519 shared secret (32 bytes).
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Generate a new random private key with RFC 7748 clamping.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::LowOrderPoint`] if the peer's public key is a
    /// low-order point and the shared secret comes out all zero.
    pub fn exchange(&self, peer_public: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&peer_public.0);

        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPoint);
        }

        Ok(SharedSecret(shared))
    }

    /// Export as bytes (for configuration files).
    ///
    /// # Security
    ///
    /// The returned bytes contain the raw private key. Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Import from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Import from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: slice.len(),
        })?;
        Ok(Self::from_bytes(bytes))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl PublicKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Import public key from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; X25519_PUBLIC_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: X25519_PUBLIC_KEY_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Get bytes as a slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Get shared secret as bytes.
    ///
    /// # Security
    ///
    /// The shared secret should go through the KDF before use as an
    /// encryption key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_x25519_key_generation() {
        let private = PrivateKey::generate(&mut OsRng);
        let public = private.public_key();

        assert_ne!(public.to_bytes(), [0u8; 32]);
    }

    #[test]
    fn test_x25519_key_exchange() {
        let router = PrivateKey::generate(&mut OsRng);
        let relay = PrivateKey::generate(&mut OsRng);

        let a = router.exchange(&relay.public_key()).unwrap();
        let b = relay.exchange(&router.public_key()).unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_reject_low_order_points() {
        let private = PrivateKey::generate(&mut OsRng);

        let zero_public = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            private.exchange(&zero_public),
            Err(CryptoError::LowOrderPoint)
        ));
    }

    #[test]
    fn test_key_serialization_roundtrip() {
        let original = PrivateKey::generate(&mut OsRng);
        let restored = PrivateKey::from_bytes(original.to_bytes());

        assert_eq!(
            original.public_key().to_bytes(),
            restored.public_key().to_bytes()
        );
    }

    #[test]
    fn test_from_slice_wrong_length() {
        assert!(PublicKey::from_slice(&[1u8; 31]).is_err());
        assert!(PrivateKey::from_slice(&[1u8; 33]).is_err());
        assert!(PublicKey::from_slice(&[1u8; 32]).is_ok());
    }

    // RFC 7748 Test Vector 1
    #[test]
    fn test_rfc7748_vector_1() {
        let scalar_bytes = [
            0xa5, 0x46, 0xe3, 0x6b, 0xf0, 0x52, 0x7c, 0x9d, 0x3b, 0x16, 0x15, 0x4b, 0x82, 0x46,
            0x5e, 0xdd, 0x62, 0x14, 0x4c, 0x0a, 0xc1, 0xfc, 0x5a, 0x18, 0x50, 0x6a, 0x22, 0x44,
            0xba, 0x44, 0x9a, 0xc4,
        ];

        let basepoint_bytes = [
            0xe6, 0xdb, 0x68, 0x67, 0x58, 0x30, 0x30, 0xdb, 0x35, 0x94, 0xc1, 0xa4, 0x24, 0xb1,
            0x5f, 0x7c, 0x72, 0x66, 0x24, 0xec, 0x26, 0xb3, 0x35, 0x3b, 0x10, 0xa9, 0x03, 0xa6,
            0xd0, 0xab, 0x1c, 0x4c,
        ];

        let expected_bytes = [
            0xc3, 0xda, 0x55, 0x37, 0x9d, 0xe9, 0xc6, 0x90, 0x8e, 0x94, 0xea, 0x4d, 0xf2, 0x8d,
            0x08, 0x4f, 0x32, 0xec, 0xcf, 0x03, 0x49, 0x1c, 0x71, 0xf7, 0x54, 0xb4, 0x07, 0x55,
            0x77, 0xa2, 0x85, 0x52,
        ];

        let private = PrivateKey::from_bytes(scalar_bytes);
        let public = PublicKey::from_bytes(basepoint_bytes);
        let shared = private.exchange(&public).unwrap();

        assert_eq!(shared.as_bytes(), &expected_bytes);
    }
}
