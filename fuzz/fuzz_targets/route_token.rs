//! Fuzz target for sealed route and continue tokens
//!
//! Opening attacker-controlled tokens must fail cleanly.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use netnext_core::tokens::{ContinueToken, RouteToken};
use netnext_crypto::x25519::{PrivateKey, PublicKey};

#[derive(Debug, Arbitrary)]
struct TokenInput {
    router_public: [u8; 32],
    receiver_private: [u8; 32],
    sealed: Vec<u8>,
}

fuzz_target!(|input: TokenInput| {
    let router_public = PublicKey::from_bytes(input.router_public);
    let receiver = PrivateKey::from_bytes(input.receiver_private);

    let _ = RouteToken::open(&input.sealed, &router_public, &receiver);
    let _ = ContinueToken::open(&input.sealed, &router_public, &receiver);

    // Plaintext parsing paths
    if let Ok(token) = RouteToken::from_bytes(&input.sealed) {
        assert_eq!(RouteToken::from_bytes(&token.to_bytes()).ok(), Some(token));
    }
    let _ = ContinueToken::from_bytes(&input.sealed);
});
