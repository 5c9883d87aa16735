//! Error types for the netnext core.
//!
//! None of these ever reach the SDK: handlers map every failure onto a
//! counter and either a direct-route response or silence.

use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Bit stream encoding error
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Packet framing or field error
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Route token construction error
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] netnext_crypto::CryptoError),
}

/// Bit stream errors, shared by the encode and decode directions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Integer outside its declared range
    #[error("value {value} outside range [{min}, {max}]")]
    ValueOutOfRange {
        /// Offending value
        value: i64,
        /// Declared minimum
        min: i64,
        /// Declared maximum
        max: i64,
    },

    /// Decoded integer above its declared maximum
    #[error("decoded value {value} above max {max}")]
    ValueAboveMax {
        /// Decoded value
        value: i64,
        /// Declared maximum
        max: i64,
    },

    /// Value does not fit the requested bit width
    #[error("{value} is not representable in {bits} bits")]
    InvalidBits {
        /// Value being written
        value: u32,
        /// Requested width
        bits: u32,
    },

    /// Reader ran out of input
    #[error("would read past end of buffer")]
    ReadPastEnd,

    /// Writer ran out of capacity
    #[error("write would overflow {capacity} byte buffer")]
    WriteOverflow {
        /// Buffer capacity in bytes
        capacity: usize,
    },

    /// Byte fields must carry at least one byte
    #[error("byte field must not be empty")]
    EmptyBytes,

    /// String longer than its field allows
    #[error("string of {len} bytes exceeds max {max}")]
    StringTooLong {
        /// String length
        len: usize,
        /// Field maximum
        max: usize,
    },

    /// Alignment padding carried set bits
    #[error("non-zero alignment bits")]
    NonZeroAlign,

    /// String bytes were not UTF-8
    #[error("invalid utf-8 string")]
    InvalidString,
}

/// Packet-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Bit stream failure inside a packet body
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Packet too short to parse
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Unknown packet type byte
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// Unknown server init response code
    #[error("unknown init response code: {0}")]
    UnknownResponseCode(u8),

    /// Route type outside the known set
    #[error("unknown route type: {0}")]
    UnknownRouteType(i32),

    /// Packet type valid but not the one expected
    #[error("unexpected packet type: expected {expected}, got {actual}")]
    UnexpectedPacketType {
        /// Expected type byte
        expected: u8,
        /// Received type byte
        actual: u8,
    },

    /// Variable-length field over its wire maximum
    #[error("{field} too large: {len} > {max}")]
    FieldTooLarge {
        /// Field name
        field: &'static str,
        /// Actual length
        len: usize,
        /// Wire maximum
        max: usize,
    },

    /// Session data blob older than the oldest supported layout
    #[error("unsupported session data version {0}")]
    InvalidSessionDataVersion(u32),

    /// Location blob malformed
    #[error("invalid location: {0}")]
    InvalidLocation(&'static str),
}

/// Route token construction errors
#[derive(Debug, Error)]
pub enum TokenError {
    /// Sealing a token failed
    #[error("crypto error: {0}")]
    Crypto(#[from] netnext_crypto::CryptoError),

    /// More nodes than a route can carry
    #[error("too many nodes: {0}")]
    TooManyNodes(usize),

    /// Output buffer not sized for the token chain
    #[error("token buffer size mismatch: expected {expected}, got {actual}")]
    BufferSize {
        /// Required size
        expected: usize,
        /// Provided size
        actual: usize,
    },

    /// Route references a relay absent from the current configuration
    #[error("relay {0:016x} not found")]
    RelayNotFound(u64),

    /// Client or server address missing from the session update
    #[error("route endpoint address missing")]
    MissingAddress,

    /// Route references a relay with no route public key
    #[error("relay {0:016x} has an invalid public key")]
    InvalidRelayKey(u64),
}

/// Portal publisher errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Transient failure; the same publisher may be retried
    #[error("retryable publish error: {0}")]
    Retryable(String),

    /// Permanent failure; no publisher should be tried
    #[error("fatal publish error: {0}")]
    Fatal(String),

    /// Every publisher used up its retries
    #[error("exceeded retry count on all {publishers} portal publishers")]
    Exhausted {
        /// Publishers tried
        publishers: usize,
    },
}

/// Billing and match-data sink errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("sink error: {0}")]
pub struct SinkError(pub String);

/// IP geolocation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocateError {
    /// No location known for the address
    #[error("no location for {0}")]
    NotFound(std::net::IpAddr),

    /// Locator backend failed
    #[error("locator unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias using the core [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_error_converts_into_packet_error() {
        let err: PacketError = EncodingError::ReadPastEnd.into();
        assert_eq!(err, PacketError::Encoding(EncodingError::ReadPastEnd));
        assert_eq!(err.to_string(), "would read past end of buffer");
    }

    #[test]
    fn test_publish_error_display() {
        let err = PublishError::Retryable("timeout".into());
        assert!(err.to_string().contains("retryable"));
    }
}
