//! Fuzz target for the session data blob echoed by the SDK

#![no_main]

use libfuzzer_sys::fuzz_target;
use netnext_core::SessionData;

fuzz_target!(|data: &[u8]| {
    let Ok(mut decoded) = SessionData::unmarshal(data) else {
        return;
    };
    if decoded.location.latitude.is_nan() || decoded.location.longitude.is_nan() {
        return;
    }

    // Anything we accept must re-encode and decode to the same state
    if let Ok(bytes) = decoded.marshal() {
        let again = SessionData::unmarshal(&bytes).expect("re-encoded session data must decode");
        assert_eq!(again, decoded);
    }
});
