//! Wire packets exchanged between game servers and the backend.
//!
//! Every datagram is framed as:
//!
//! ```text
//! +----------+----------------------+---------------------------+
//! | type (1) | hash placeholder (8) | bit-packed body           |
//! +----------+----------------------+---------------------------+
//! ```
//!
//! Server init, server update and session update bodies additionally carry
//! a trailing 64-byte Ed25519 signature made with the buyer's key. The hash
//! placeholder is written as zeros and ignored on read.

pub mod server;
pub mod session;

use std::fmt;
use std::str::FromStr;

use crate::encoding::{ReadStream, WriteStream};
use crate::error::PacketError;
use crate::{DEFAULT_MAX_PACKET_SIZE, PACKET_HASH_SIZE};

pub use server::{InitResponseCode, ServerInitRequestPacket, ServerInitResponsePacket, ServerUpdatePacket};
pub use session::{FallbackFlags, SessionResponsePacket, SessionUpdatePacket};

/// Size of the type byte plus hash placeholder
pub const PACKET_HEADER_SIZE: usize = 1 + PACKET_HASH_SIZE;

/// Packet type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Server session-count heartbeat
    ServerUpdate = 220,
    /// Per-slice session update from a game server
    SessionUpdate = 221,
    /// Backend answer to a session update
    SessionResponse = 222,
    /// Game server registration
    ServerInitRequest = 223,
    /// Backend answer to a registration
    ServerInitResponse = 224,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            220 => Ok(Self::ServerUpdate),
            221 => Ok(Self::SessionUpdate),
            222 => Ok(Self::SessionResponse),
            223 => Ok(Self::ServerInitRequest),
            224 => Ok(Self::ServerInitResponse),
            _ => Err(PacketError::UnknownPacketType(value)),
        }
    }
}

/// SDK version carried by every SDK-originated packet.
///
/// Ordering is lexicographic on (major, minor, patch).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SdkVersion {
    /// Major component
    pub major: u8,
    /// Minor component
    pub minor: u8,
    /// Patch component
    pub patch: u8,
}

impl SdkVersion {
    /// Create a version.
    #[must_use]
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether this version is `major.minor.patch` or newer
    #[must_use]
    pub fn at_least(&self, major: u8, minor: u8, patch: u8) -> bool {
        *self >= Self::new(major, minor, patch)
    }

    pub(crate) fn write(&self, stream: &mut WriteStream) -> Result<(), PacketError> {
        stream.write_bits(u32::from(self.major), 8)?;
        stream.write_bits(u32::from(self.minor), 8)?;
        stream.write_bits(u32::from(self.patch), 8)?;
        Ok(())
    }

    pub(crate) fn read(stream: &mut ReadStream<'_>) -> Result<Self, PacketError> {
        let major = stream.read_bits(8)? as u8;
        let minor = stream.read_bits(8)? as u8;
        let patch = stream.read_bits(8)? as u8;
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error parsing a dotted SDK version string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sdk version: {0}")]
pub struct ParseSdkVersionError(String);

impl FromStr for SdkVersion {
    type Err = ParseSdkVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(ParseSdkVersionError(s.to_string()));
        }
        let parse = |part: &str| {
            part.parse::<u8>()
                .map_err(|_| ParseSdkVersionError(s.to_string()))
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

/// A packet body with a fixed type tag.
pub trait Packet {
    /// Type byte written in front of the body
    const PACKET_TYPE: PacketType;

    /// Serialize the body into `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] when a field exceeds its wire maximum.
    fn write(&self, stream: &mut WriteStream) -> Result<(), PacketError>;

    /// Serialize the body alone.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] when a field exceeds its wire maximum.
    fn marshal(&self) -> Result<Vec<u8>, PacketError> {
        let mut stream = WriteStream::new(DEFAULT_MAX_PACKET_SIZE);
        self.write(&mut stream)?;
        Ok(stream.finish())
    }

    /// Serialize the body and prepend the packet header.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] when a field exceeds its wire maximum.
    fn marshal_framed(&self) -> Result<Vec<u8>, PacketError> {
        Ok(write_frame(Self::PACKET_TYPE, &self.marshal()?))
    }
}

/// Prepend the type byte and zeroed hash placeholder to `body`.
#[must_use]
pub fn write_frame(packet_type: PacketType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + body.len());
    out.push(packet_type as u8);
    out.extend_from_slice(&[0u8; PACKET_HASH_SIZE]);
    out.extend_from_slice(body);
    out
}

/// Split a datagram into its packet type and the payload after the header.
///
/// # Errors
///
/// Returns [`PacketError::TooShort`] for datagrams shorter than the header
/// and [`PacketError::UnknownPacketType`] for unrecognized type bytes.
pub fn read_frame(data: &[u8]) -> Result<(PacketType, &[u8]), PacketError> {
    if data.len() < PACKET_HEADER_SIZE {
        return Err(PacketError::TooShort {
            expected: PACKET_HEADER_SIZE,
            actual: data.len(),
        });
    }
    let packet_type = PacketType::try_from(data[0])?;
    Ok((packet_type, &data[PACKET_HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_roundtrip() {
        for tag in 220u8..=224 {
            let packet_type = PacketType::try_from(tag).unwrap();
            assert_eq!(packet_type as u8, tag);
        }
        assert_eq!(
            PacketType::try_from(219),
            Err(PacketError::UnknownPacketType(219))
        );
    }

    #[test]
    fn test_sdk_version_ordering() {
        let v = SdkVersion::new(4, 0, 4);
        assert!(v.at_least(4, 0, 4));
        assert!(v.at_least(4, 0, 2));
        assert!(!v.at_least(4, 0, 5));
        assert!(!v.at_least(5, 0, 0));
        assert!(SdkVersion::new(3, 9, 9) < SdkVersion::new(4, 0, 0));
    }

    #[test]
    fn test_sdk_version_parse() {
        assert_eq!("4.0.10".parse::<SdkVersion>().unwrap(), SdkVersion::new(4, 0, 10));
        assert!("4.0".parse::<SdkVersion>().is_err());
        assert!("4.x.0".parse::<SdkVersion>().is_err());
        assert_eq!(SdkVersion::new(4, 0, 6).to_string(), "4.0.6");
    }

    #[test]
    fn test_frame_layout() {
        let framed = write_frame(PacketType::SessionResponse, &[1, 2, 3]);
        assert_eq!(framed.len(), PACKET_HEADER_SIZE + 3);
        assert_eq!(framed[0], 222);
        assert!(framed[1..9].iter().all(|b| *b == 0));

        let (packet_type, payload) = read_frame(&framed).unwrap();
        assert_eq!(packet_type, PacketType::SessionResponse);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_frame_too_short() {
        assert!(matches!(
            read_frame(&[221, 0, 0]),
            Err(PacketError::TooShort { expected: 9, actual: 3 })
        ));
    }
}
