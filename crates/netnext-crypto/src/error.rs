//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Sealed box shorter than its fixed overhead
    #[error("sealed box too short: {0} bytes")]
    SealedTooShort(usize),

    /// Key agreement produced an all-zero shared secret
    #[error("key agreement rejected: low-order public key")]
    LowOrderPoint,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,
}
