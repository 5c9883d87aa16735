//! # netnext Crypto
//!
//! Cryptographic primitives for the netnext session routing backend.
//!
//! This crate provides:
//! - X25519 key agreement for per-hop route token sealing
//! - Detached in-place `XChaCha20-Poly1305` encryption
//! - Sealed boxes (X25519 + BLAKE3 KDF + `XChaCha20-Poly1305`) for route tokens
//! - Ed25519 packet signatures for SDK-to-backend authentication
//! - BLAKE3 key derivation and the FNV-1a identifier hash
//! - OS random bytes for nonces and token keys
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | KDF | BLAKE3 (keyed, context) | 128-bit |
//! | Signatures | Ed25519 | 128-bit |
//! | Identifier hash | FNV-1a 64 | non-cryptographic |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod random;
pub mod sealed;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;
pub use hash::hash_id;
pub use sealed::{SEALED_OVERHEAD, open, seal};
pub use signatures::{sign_packet, verify_packet};

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Size of the zero-filled hash placeholder that follows the packet type byte
pub const PACKET_HASH_SIZE: usize = 8;
