//! Raw bit packing.
//!
//! Values are packed least-significant bit first into consecutive bytes,
//! which is byte-for-byte identical to packing into little-endian 32-bit
//! words. Byte runs are only ever written at byte-aligned positions.

use crate::error::EncodingError;

/// Number of bits needed to encode any value in `[min, max]`.
#[must_use]
pub fn bits_required(min: u32, max: u32) -> u32 {
    if min == max {
        0
    } else {
        32 - (max - min).leading_zeros()
    }
}

/// Signed variant of [`bits_required`], measured on the span `max - min`.
#[must_use]
pub fn bits_required_signed(min: i32, max: i32) -> u32 {
    bits_required(0, max.wrapping_sub(min) as u32)
}

/// Append-only bit writer with a hard capacity
#[derive(Debug)]
pub struct BitWriter {
    data: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
    bits_written: usize,
    capacity: usize,
}

impl BitWriter {
    /// Create a writer that refuses to grow past `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            scratch: 0,
            scratch_bits: 0,
            bits_written: 0,
            capacity,
        }
    }

    /// Write the low `bits` bits of `value`.
    ///
    /// Writing zero bits is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::InvalidBits`] if `value` does not fit or
    /// `bits > 32`, and [`EncodingError::WriteOverflow`] past capacity.
    pub fn write_bits(&mut self, value: u32, bits: u32) -> Result<(), EncodingError> {
        if bits == 0 {
            return Ok(());
        }
        if bits > 32 || (bits < 32 && u64::from(value) >= 1u64 << bits) {
            return Err(EncodingError::InvalidBits { value, bits });
        }
        if self.bits_written + bits as usize > self.capacity * 8 {
            return Err(EncodingError::WriteOverflow {
                capacity: self.capacity,
            });
        }

        self.scratch |= u64::from(value) << self.scratch_bits;
        self.scratch_bits += bits;
        while self.scratch_bits >= 8 {
            self.data.push((self.scratch & 0xFF) as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
        self.bits_written += bits as usize;
        Ok(())
    }

    /// Pad with zero bits up to the next byte boundary.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::WriteOverflow`] past capacity.
    pub fn write_align(&mut self) -> Result<(), EncodingError> {
        let align = self.align_bits();
        self.write_bits(0, align)
    }

    /// Append a run of bytes at the current (byte-aligned) position.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::WriteOverflow`] past capacity.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodingError> {
        debug_assert_eq!(self.scratch_bits, 0, "write_bytes requires alignment");
        if self.bits_written + bytes.len() * 8 > self.capacity * 8 {
            return Err(EncodingError::WriteOverflow {
                capacity: self.capacity,
            });
        }
        self.data.extend_from_slice(bytes);
        self.bits_written += bytes.len() * 8;
        Ok(())
    }

    /// Zero bits needed to reach the next byte boundary
    #[must_use]
    pub fn align_bits(&self) -> u32 {
        ((8 - self.bits_written % 8) % 8) as u32
    }

    /// Total bits written so far
    #[must_use]
    pub fn bits_written(&self) -> usize {
        self.bits_written
    }

    /// Bytes the output will occupy once flushed
    #[must_use]
    pub fn bytes_written(&self) -> usize {
        self.bits_written.div_ceil(8)
    }

    /// Flush any partial byte and return the encoded buffer.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        if self.scratch_bits > 0 {
            self.data.push((self.scratch & 0xFF) as u8);
        }
        self.data
    }
}

/// Bit reader over a borrowed buffer
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bits_read: usize,
}

impl<'a> BitReader<'a> {
    /// Create a reader positioned at the first bit of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bits_read: 0 }
    }

    /// Whether reading `bits` more bits would run off the end
    #[must_use]
    pub fn would_read_past_end(&self, bits: usize) -> bool {
        self.bits_read + bits > self.data.len() * 8
    }

    /// Read `bits` bits (at most 32).
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ReadPastEnd`] when the buffer is exhausted.
    pub fn read_bits(&mut self, bits: u32) -> Result<u32, EncodingError> {
        debug_assert!(bits <= 32);
        if self.would_read_past_end(bits as usize) {
            return Err(EncodingError::ReadPastEnd);
        }

        let mut value: u64 = 0;
        let mut got = 0u32;
        while got < bits {
            let byte = self.data[self.bits_read / 8];
            let offset = (self.bits_read % 8) as u32;
            let take = (8 - offset).min(bits - got);
            let chunk = (u64::from(byte) >> offset) & ((1u64 << take) - 1);
            value |= chunk << got;
            got += take;
            self.bits_read += take as usize;
        }
        Ok(value as u32)
    }

    /// Skip to the next byte boundary; the skipped bits must be zero.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::NonZeroAlign`] on set padding bits.
    pub fn read_align(&mut self) -> Result<(), EncodingError> {
        let align = self.align_bits();
        if align > 0 && self.read_bits(align)? != 0 {
            return Err(EncodingError::NonZeroAlign);
        }
        Ok(())
    }

    /// Borrow `len` bytes from the current (byte-aligned) position.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::ReadPastEnd`] when the buffer is exhausted.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], EncodingError> {
        debug_assert_eq!(self.bits_read % 8, 0, "read_bytes requires alignment");
        if self.would_read_past_end(len * 8) {
            return Err(EncodingError::ReadPastEnd);
        }
        let start = self.bits_read / 8;
        self.bits_read += len * 8;
        Ok(&self.data[start..start + len])
    }

    /// Padding bits before the next byte boundary
    #[must_use]
    pub fn align_bits(&self) -> u32 {
        ((8 - self.bits_read % 8) % 8) as u32
    }

    /// Total bits consumed
    #[must_use]
    pub fn bits_read(&self) -> usize {
        self.bits_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_required() {
        assert_eq!(bits_required(0, 0), 0);
        assert_eq!(bits_required(0, 1), 1);
        assert_eq!(bits_required(0, 2), 2);
        assert_eq!(bits_required(0, 7), 3);
        assert_eq!(bits_required(0, 255), 8);
        assert_eq!(bits_required(0, 511), 9);
        assert_eq!(bits_required(0, 10000), 14);
        assert_eq!(bits_required(0, u32::MAX), 32);
        assert_eq!(bits_required_signed(-10, 10), 5);
    }

    #[test]
    fn test_lsb_first_packing() {
        let mut writer = BitWriter::new(4);
        writer.write_bits(1, 1).unwrap();
        writer.write_bits(0b101, 3).unwrap();
        writer.write_bits(0xF, 4).unwrap();
        writer.write_bits(0x3, 2).unwrap();
        let out = writer.finish();
        assert_eq!(out, vec![0b1111_1011, 0b0000_0011]);
    }

    #[test]
    fn test_matches_little_endian_words() {
        let mut writer = BitWriter::new(8);
        writer.write_bits(0xDEAD_BEEF, 32).unwrap();
        writer.write_bits(0x1234, 16).unwrap();
        let out = writer.finish();
        assert_eq!(out, vec![0xEF, 0xBE, 0xAD, 0xDE, 0x34, 0x12]);
    }

    #[test]
    fn test_reader_recovers_values() {
        let mut writer = BitWriter::new(16);
        writer.write_bits(5, 3).unwrap();
        writer.write_bits(0xABCD_1234, 32).unwrap();
        writer.write_align().unwrap();
        writer.write_bytes(&[9, 8, 7]).unwrap();
        let out = writer.finish();

        let mut reader = BitReader::new(&out);
        assert_eq!(reader.read_bits(3).unwrap(), 5);
        assert_eq!(reader.read_bits(32).unwrap(), 0xABCD_1234);
        reader.read_align().unwrap();
        assert_eq!(reader.read_bytes(3).unwrap(), &[9, 8, 7]);
        assert!(reader.read_bits(1).is_err());
    }

    #[test]
    fn test_write_rejects_unrepresentable_value() {
        let mut writer = BitWriter::new(4);
        assert_eq!(
            writer.write_bits(4, 2),
            Err(EncodingError::InvalidBits { value: 4, bits: 2 })
        );
    }

    #[test]
    fn test_write_overflow() {
        let mut writer = BitWriter::new(1);
        writer.write_bits(0xFF, 8).unwrap();
        assert!(matches!(
            writer.write_bits(1, 1),
            Err(EncodingError::WriteOverflow { capacity: 1 })
        ));
    }

    #[test]
    fn test_nonzero_align_rejected() {
        let data = [0b0000_0011u8, 0];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(1).unwrap(), 1);
        assert_eq!(reader.read_align(), Err(EncodingError::NonZeroAlign));
    }
}
