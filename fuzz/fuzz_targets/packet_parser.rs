//! Fuzz target for datagram parsing
//!
//! Every decoder reachable from the socket must return Ok or Err on arbitrary
//! bytes, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use netnext_core::SdkVersion;
use netnext_core::packets::{
    ServerInitRequestPacket, ServerUpdatePacket, SessionResponsePacket, SessionUpdatePacket,
    read_frame,
};

fuzz_target!(|data: &[u8]| {
    let _ = read_frame(data);

    let _ = SessionUpdatePacket::unmarshal(data);
    let _ = ServerInitRequestPacket::unmarshal(data);
    let _ = ServerUpdatePacket::unmarshal(data);

    // Response layout depends on the SDK version
    for version in [SdkVersion::new(4, 0, 0), SdkVersion::new(4, 0, 4), SdkVersion::new(4, 1, 0)] {
        let _ = SessionResponsePacket::unmarshal(data, version);
    }
});
