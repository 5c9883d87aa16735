//! Authenticated public-key sealed boxes.
//!
//! A sealed box is addressed from a sender key pair to a single receiver:
//! the X25519 shared secret between the two is run through a BLAKE3
//! derive-key context together with both public keys, and the result keys
//! an `XChaCha20-Poly1305` encryption under a fresh random nonce.
//!
//! Wire layout (40 bytes of overhead):
//!
//! ```text
//! +----------------+-------------+----------------------+
//! | nonce (24)     | tag (16)    | ciphertext (n)       |
//! +----------------+-------------+----------------------+
//! ```

use crate::aead::{AeadKey, NONCE_SIZE, Nonce, TAG_SIZE, Tag};
use crate::hash::Kdf;
use crate::random::random_24;
use crate::x25519::{PrivateKey, PublicKey};
use crate::CryptoError;

/// Bytes a sealed box adds on top of its plaintext.
pub const SEALED_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

const SEALED_BOX_CONTEXT: &str = "netnext sealed box v1";

fn box_key(
    own_private: &PrivateKey,
    peer_public: &PublicKey,
    sender_public: &PublicKey,
    receiver_public: &PublicKey,
) -> Result<AeadKey, CryptoError> {
    let shared = own_private.exchange(peer_public)?;

    let mut ikm = [0u8; 96];
    ikm[..32].copy_from_slice(shared.as_bytes());
    ikm[32..64].copy_from_slice(sender_public.as_bytes());
    ikm[64..].copy_from_slice(receiver_public.as_bytes());

    Ok(AeadKey::new(Kdf::new(SEALED_BOX_CONTEXT).derive_key(&ikm)))
}

/// Seal `plaintext` from `sender` to `receiver` into `out`.
///
/// `out` must be exactly `plaintext.len() + SEALED_OVERHEAD` bytes.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyLength`] if `out` has the wrong size,
/// [`CryptoError::LowOrderPoint`] for a degenerate receiver key, or
/// [`CryptoError::RandomFailed`] if nonce generation fails.
pub fn seal_into(
    sender: &PrivateKey,
    receiver: &PublicKey,
    plaintext: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    if out.len() != plaintext.len() + SEALED_OVERHEAD {
        return Err(CryptoError::InvalidKeyLength {
            expected: plaintext.len() + SEALED_OVERHEAD,
            actual: out.len(),
        });
    }

    let key = box_key(sender, receiver, &sender.public_key(), receiver)?;
    let nonce = Nonce::from_bytes(random_24()?);

    let (header, body) = out.split_at_mut(SEALED_OVERHEAD);
    body.copy_from_slice(plaintext);
    let tag = key.encrypt_in_place(&nonce, body, &[])?;

    header[..NONCE_SIZE].copy_from_slice(nonce.as_bytes());
    header[NONCE_SIZE..].copy_from_slice(tag.as_bytes());
    Ok(())
}

/// Seal `plaintext` from `sender` to `receiver`, allocating the output.
///
/// # Errors
///
/// See [`seal_into`].
pub fn seal(
    sender: &PrivateKey,
    receiver: &PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; plaintext.len() + SEALED_OVERHEAD];
    seal_into(sender, receiver, plaintext, &mut out)?;
    Ok(out)
}

/// Open a sealed box addressed to `receiver` from `sender`.
///
/// # Errors
///
/// Returns [`CryptoError::SealedTooShort`] if the input cannot hold the
/// overhead, or [`CryptoError::DecryptionFailed`] if authentication fails.
pub fn open(
    receiver: &PrivateKey,
    sender: &PublicKey,
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEALED_OVERHEAD {
        return Err(CryptoError::SealedTooShort(sealed.len()));
    }

    let key = box_key(receiver, sender, sender, &receiver.public_key())?;

    let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]).ok_or(CryptoError::DecryptionFailed)?;
    let tag = Tag::from_slice(&sealed[NONCE_SIZE..SEALED_OVERHEAD])
        .ok_or(CryptoError::DecryptionFailed)?;

    let mut plaintext = sealed[SEALED_OVERHEAD..].to_vec();
    key.decrypt_in_place(&nonce, &mut plaintext, &tag, &[])?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_seal_open_roundtrip() {
        let router = PrivateKey::generate(&mut OsRng);
        let relay = PrivateKey::generate(&mut OsRng);

        let sealed = seal(&router, &relay.public_key(), &[0xAB; 76]).unwrap();
        assert_eq!(sealed.len(), 116);

        let opened = open(&relay, &router.public_key(), &sealed).unwrap();
        assert_eq!(opened, vec![0xAB; 76]);
    }

    #[test]
    fn test_continue_token_size() {
        let router = PrivateKey::generate(&mut OsRng);
        let relay = PrivateKey::generate(&mut OsRng);

        let sealed = seal(&router, &relay.public_key(), &[1u8; 17]).unwrap();
        assert_eq!(sealed.len(), 57);
    }

    #[test]
    fn test_wrong_receiver_cannot_open() {
        let router = PrivateKey::generate(&mut OsRng);
        let relay = PrivateKey::generate(&mut OsRng);
        let eavesdropper = PrivateKey::generate(&mut OsRng);

        let sealed = seal(&router, &relay.public_key(), b"hop").unwrap();
        assert!(open(&eavesdropper, &router.public_key(), &sealed).is_err());
    }

    #[test]
    fn test_wrong_sender_rejected() {
        let router = PrivateKey::generate(&mut OsRng);
        let impostor = PrivateKey::generate(&mut OsRng);
        let relay = PrivateKey::generate(&mut OsRng);

        let sealed = seal(&impostor, &relay.public_key(), b"hop").unwrap();
        assert!(open(&relay, &router.public_key(), &sealed).is_err());
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let router = PrivateKey::generate(&mut OsRng);
        let relay = PrivateKey::generate(&mut OsRng);

        let a = seal(&router, &relay.public_key(), b"same").unwrap();
        let b = seal(&router, &relay.public_key(), b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_seal_into_wrong_size() {
        let router = PrivateKey::generate(&mut OsRng);
        let relay = PrivateKey::generate(&mut OsRng);
        let mut out = [0u8; 10];
        assert!(seal_into(&router, &relay.public_key(), b"abc", &mut out).is_err());
    }

    #[test]
    fn test_open_too_short() {
        let relay = PrivateKey::generate(&mut OsRng);
        let router = PrivateKey::generate(&mut OsRng);
        assert!(matches!(
            open(&relay, &router.public_key(), &[0u8; 39]),
            Err(CryptoError::SealedTooShort(39))
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Flipping any bit of a sealed box makes it fail to open
            #[test]
            fn tampered_box_never_opens(
                message in prop::collection::vec(any::<u8>(), 1..128),
                index in any::<prop::sample::Index>(),
                bit in 0u8..8,
            ) {
                let router = PrivateKey::generate(&mut OsRng);
                let relay = PrivateKey::generate(&mut OsRng);

                let mut sealed = seal(&router, &relay.public_key(), &message).unwrap();
                let at = index.index(sealed.len());
                sealed[at] ^= 1 << bit;

                prop_assert!(open(&relay, &router.public_key(), &sealed).is_err());
            }
        }
    }
}
