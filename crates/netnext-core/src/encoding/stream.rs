//! Typed serialization over the bit packer.
//!
//! [`WriteStream`] and [`ReadStream`] mirror each other method for method;
//! every packet and the session data blob are written as a fixed sequence
//! of these calls.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::bits::{BitReader, BitWriter, bits_required_signed};
use crate::error::EncodingError;

const ADDRESS_NONE: u32 = 0;
const ADDRESS_IPV4: u32 = 1;
const ADDRESS_IPV6: u32 = 2;

/// Encoding stream with a fixed byte capacity
#[derive(Debug)]
pub struct WriteStream {
    writer: BitWriter,
}

impl WriteStream {
    /// Create a stream that fails once more than `capacity` bytes are written.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            writer: BitWriter::new(capacity),
        }
    }

    /// Write raw bits.
    ///
    /// # Errors
    ///
    /// Fails if `value` needs more than `bits` bits or capacity runs out.
    pub fn write_bits(&mut self, value: u32, bits: u32) -> Result<(), EncodingError> {
        self.writer.write_bits(value, bits)
    }

    /// Write `value` as an offset from `min` in the fewest bits that cover `[min, max]`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ValueOutOfRange`] if `value` is outside the range.
    pub fn write_integer(&mut self, value: i32, min: i32, max: i32) -> Result<(), EncodingError> {
        if value < min || value > max {
            return Err(EncodingError::ValueOutOfRange {
                value: i64::from(value),
                min: i64::from(min),
                max: i64::from(max),
            });
        }
        let bits = bits_required_signed(min, max);
        self.writer
            .write_bits(value.wrapping_sub(min) as u32, bits)
    }

    /// Write a `usize` count or length as a ranged integer.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ValueOutOfRange`] if `value > max`.
    pub fn write_count(&mut self, value: usize, max: usize) -> Result<(), EncodingError> {
        let value = i32::try_from(value).map_err(|_| EncodingError::ValueOutOfRange {
            value: i64::MAX,
            min: 0,
            max: max as i64,
        })?;
        self.write_integer(value, 0, max as i32)
    }

    /// Write a full 32-bit value.
    ///
    /// # Errors
    ///
    /// Fails when capacity runs out.
    pub fn write_u32(&mut self, value: u32) -> Result<(), EncodingError> {
        self.writer.write_bits(value, 32)
    }

    /// Write a 64-bit value as low word then high word.
    ///
    /// # Errors
    ///
    /// Fails when capacity runs out.
    pub fn write_u64(&mut self, value: u64) -> Result<(), EncodingError> {
        self.writer.write_bits((value & 0xFFFF_FFFF) as u32, 32)?;
        self.writer.write_bits((value >> 32) as u32, 32)
    }

    /// Write a single-bit boolean.
    ///
    /// # Errors
    ///
    /// Fails when capacity runs out.
    pub fn write_bool(&mut self, value: bool) -> Result<(), EncodingError> {
        self.writer.write_bits(u32::from(value), 1)
    }

    /// Write an `f32` as its IEEE-754 bit pattern.
    ///
    /// # Errors
    ///
    /// Fails when capacity runs out.
    pub fn write_f32(&mut self, value: f32) -> Result<(), EncodingError> {
        self.writer.write_bits(value.to_bits(), 32)
    }

    /// Align, then write `bytes` verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::EmptyBytes`] for an empty slice.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodingError> {
        if bytes.is_empty() {
            return Err(EncodingError::EmptyBytes);
        }
        self.writer.write_align()?;
        self.writer.write_bytes(bytes)
    }

    /// Write a string as a length in `[0, max - 1]` followed by its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::StringTooLong`] if `value.len() >= max`.
    pub fn write_string(&mut self, value: &str, max: usize) -> Result<(), EncodingError> {
        if value.len() >= max {
            return Err(EncodingError::StringTooLong {
                len: value.len(),
                max,
            });
        }
        self.write_count(value.len(), max - 1)?;
        if !value.is_empty() {
            self.write_bytes(value.as_bytes())?;
        }
        Ok(())
    }

    /// Write an optional UDP address.
    ///
    /// IPv4 addresses are aligned 4 bytes in network order; IPv6 addresses
    /// are eight 16-bit words. Both are followed by a 16-bit port.
    ///
    /// # Errors
    ///
    /// Fails when capacity runs out.
    pub fn write_address(&mut self, addr: Option<&SocketAddr>) -> Result<(), EncodingError> {
        match addr {
            None => self.write_bits(ADDRESS_NONE, 2),
            Some(SocketAddr::V4(v4)) => {
                self.write_bits(ADDRESS_IPV4, 2)?;
                self.write_bytes(&v4.ip().octets())?;
                self.write_bits(u32::from(v4.port()), 16)
            }
            Some(SocketAddr::V6(v6)) => {
                self.write_bits(ADDRESS_IPV6, 2)?;
                for segment in v6.ip().segments() {
                    self.write_bits(u32::from(segment), 16)?;
                }
                self.write_bits(u32::from(v6.port()), 16)
            }
        }
    }

    /// Pad with zero bits to the next byte boundary.
    ///
    /// # Errors
    ///
    /// Fails when capacity runs out.
    pub fn write_align(&mut self) -> Result<(), EncodingError> {
        self.writer.write_align()
    }

    /// Bytes written so far, rounding a partial byte up
    #[must_use]
    pub fn bytes_processed(&self) -> usize {
        self.writer.bytes_written()
    }

    /// Finish the stream and return its bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }
}

/// Decoding stream over a borrowed buffer
#[derive(Debug)]
pub struct ReadStream<'a> {
    reader: BitReader<'a>,
}

impl<'a> ReadStream<'a> {
    /// Create a stream reading from the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
        }
    }

    /// Read raw bits.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ReadPastEnd`] when input runs out.
    pub fn read_bits(&mut self, bits: u32) -> Result<u32, EncodingError> {
        self.reader.read_bits(bits)
    }

    /// Read an integer written by [`WriteStream::write_integer`].
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ValueAboveMax`] if the decoded value exceeds `max`.
    pub fn read_integer(&mut self, min: i32, max: i32) -> Result<i32, EncodingError> {
        let bits = bits_required_signed(min, max);
        let raw = self.reader.read_bits(bits)?;
        let value = i64::from(min) + i64::from(raw);
        if value > i64::from(max) {
            return Err(EncodingError::ValueAboveMax {
                value,
                max: i64::from(max),
            });
        }
        Ok(value as i32)
    }

    /// Read a count written by [`WriteStream::write_count`].
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ValueAboveMax`] if the count exceeds `max`.
    pub fn read_count(&mut self, max: usize) -> Result<usize, EncodingError> {
        Ok(self.read_integer(0, max as i32)? as usize)
    }

    /// Read a full 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ReadPastEnd`] when input runs out.
    pub fn read_u32(&mut self) -> Result<u32, EncodingError> {
        self.reader.read_bits(32)
    }

    /// Read a 64-bit value written low word first.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ReadPastEnd`] when input runs out.
    pub fn read_u64(&mut self) -> Result<u64, EncodingError> {
        let lo = u64::from(self.reader.read_bits(32)?);
        let hi = u64::from(self.reader.read_bits(32)?);
        Ok((hi << 32) | lo)
    }

    /// Read a single-bit boolean.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ReadPastEnd`] when input runs out.
    pub fn read_bool(&mut self) -> Result<bool, EncodingError> {
        Ok(self.reader.read_bits(1)? == 1)
    }

    /// Read an `f32` from its IEEE-754 bit pattern.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ReadPastEnd`] when input runs out.
    pub fn read_f32(&mut self) -> Result<f32, EncodingError> {
        Ok(f32::from_bits(self.reader.read_bits(32)?))
    }

    /// Align, then borrow `len` bytes.
    ///
    /// # Errors
    ///
    /// Fails on non-zero padding or when input runs out.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], EncodingError> {
        if len == 0 {
            return Err(EncodingError::EmptyBytes);
        }
        self.reader.read_align()?;
        self.reader.read_bytes(len)
    }

    /// Align, then read exactly `N` bytes into an array.
    ///
    /// # Errors
    ///
    /// Fails on non-zero padding or when input runs out.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Read a string written by [`WriteStream::write_string`].
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::InvalidString`] for non-UTF-8 bytes.
    pub fn read_string(&mut self, max: usize) -> Result<String, EncodingError> {
        let len = self.read_count(max - 1)?;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| EncodingError::InvalidString)
    }

    /// Read an optional UDP address. Unknown type tags decode as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ReadPastEnd`] when input runs out.
    pub fn read_address(&mut self) -> Result<Option<SocketAddr>, EncodingError> {
        match self.read_bits(2)? {
            ADDRESS_IPV4 => {
                let octets = self.read_array::<4>()?;
                let port = self.read_bits(16)? as u16;
                Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)))
            }
            ADDRESS_IPV6 => {
                let mut segments = [0u16; 8];
                for segment in &mut segments {
                    *segment = self.read_bits(16)? as u16;
                }
                let port = self.read_bits(16)? as u16;
                Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(segments)), port)))
            }
            _ => Ok(None),
        }
    }

    /// Skip padding to the next byte boundary.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::NonZeroAlign`] on set padding bits.
    pub fn read_align(&mut self) -> Result<(), EncodingError> {
        self.reader.read_align()
    }

    /// Bytes consumed so far, rounding a partial byte up
    #[must_use]
    pub fn bytes_processed(&self) -> usize {
        self.reader.bits_read().div_ceil(8)
    }
}
