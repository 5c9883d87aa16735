//! Key derivation and identifier hashing.
//!
//! Provides:
//! - Context-separated key derivation (BLAKE3 derive-key mode), which turns
//!   an X25519 shared secret into a sealed box key
//! - FNV-1a 64-bit identifier hashing, used for buyer tags such as `"pro"`,
//!   datacenter aliases and server identifiers derived from address strings

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let kdf = Kdf::new("netnext route token v1");
    /// let key = kdf.derive_key(shared_secret.as_bytes());
    /// ```
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        blake3::derive_key(self.context, ikm)
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a hash of a string identifier.
///
/// Buyers tag sessions with hashed strings; the backend compares the
/// hash against well-known values (for example `hash_id("pro")`).
#[must_use]
pub fn hash_id(s: &str) -> u64 {
    let mut h = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        h ^= u64::from(byte);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_context_separation() {
        let a = Kdf::new("context a").derive_key(b"ikm");
        let b = Kdf::new("context b").derive_key(b"ikm");
        assert_ne!(a, b);
    }

    #[test]
    fn test_kdf_deterministic() {
        let kdf = Kdf::new("netnext sealed box v1");
        assert_eq!(kdf.derive_key(b"shared"), kdf.derive_key(b"shared"));
        assert_ne!(kdf.derive_key(b"shared"), kdf.derive_key(b"sharee"));
    }

    #[test]
    fn test_hash_id_known_values() {
        // FNV-1a 64 reference values
        assert_eq!(hash_id(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(hash_id("a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_hash_id_pro_stable() {
        assert_eq!(hash_id("pro"), hash_id("pro"));
        assert_ne!(hash_id("pro"), hash_id("Pro"));
    }
}
