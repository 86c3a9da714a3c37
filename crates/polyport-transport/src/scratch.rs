//! Reusable receive buffer and the payload view handed to the upper layer.
//!
//! One [`ScratchBuffer`] is allocated per run, sized for the largest payload
//! any backend of the run can deliver. Every received payload is copied into
//! it and exposed as a borrowed [`Payload`] for the duration of one
//! `receive` callback.

/// Errors from the scratch buffer and bit reader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScratchError {
    /// The payload does not fit in the buffer.
    #[error("payload of {len} bytes exceeds scratch capacity {capacity}")]
    Overflow {
        /// Size of the rejected payload.
        len: usize,
        /// Capacity of the buffer.
        capacity: usize,
    },

    /// A read asked for more bits than remain.
    #[error("read of {requested} bits with only {remaining} remaining")]
    OutOfBounds {
        /// Bits requested.
        requested: usize,
        /// Bits left in the payload.
        remaining: usize,
    },

    /// A single read asked for more than 32 bits.
    #[error("cannot read {requested} bits at once, the limit is 32")]
    TooManyBits {
        /// Bits requested.
        requested: usize,
    },
}

/// Fixed-capacity byte buffer reused for every received payload.
#[derive(Debug)]
pub struct ScratchBuffer {
    bytes: Box<[u8]>,
    len: usize,
}

impl ScratchBuffer {
    /// Allocate a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Largest payload the buffer accepts.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Replace the contents with `data`. Oversized payloads are rejected
    /// whole, never truncated.
    pub fn write(&mut self, data: &[u8]) -> Result<Payload<'_>, ScratchError> {
        if data.len() > self.bytes.len() {
            return Err(ScratchError::Overflow {
                len: data.len(),
                capacity: self.bytes.len(),
            });
        }
        self.bytes[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(Payload {
            bytes: &self.bytes[..self.len],
        })
    }
}

/// A received payload, valid for one callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payload<'a> {
    bytes: &'a [u8],
}

impl<'a> Payload<'a> {
    /// Raw payload bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bit-level reader positioned at the start of the payload.
    pub fn reader(&self) -> BitReader<'a> {
        BitReader::new(self.bytes)
    }
}

/// Little-endian, LSB-first bit reader.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    /// Reader over `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, bit: 0 }
    }

    /// Bits consumed so far.
    pub fn position(&self) -> usize {
        self.bit
    }

    /// Bits left to read.
    pub fn bits_remaining(&self) -> usize {
        self.bytes.len() * 8 - self.bit
    }

    /// Read up to 32 bits as an unsigned value.
    pub fn read_bits(&mut self, count: usize) -> Result<u32, ScratchError> {
        if count > 32 {
            return Err(ScratchError::TooManyBits { requested: count });
        }
        if count > self.bits_remaining() {
            return Err(ScratchError::OutOfBounds {
                requested: count,
                remaining: self.bits_remaining(),
            });
        }

        let mut value = 0u32;
        let mut read = 0;
        while read < count {
            let byte = self.bytes[self.bit / 8];
            let offset = self.bit % 8;
            let take = (8 - offset).min(count - read);
            let chunk = (u32::from(byte) >> offset) & ((1u32 << take) - 1);
            value |= chunk << read;
            read += take;
            self.bit += take;
        }
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool, ScratchError> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_u8(&mut self) -> Result<u8, ScratchError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, ScratchError> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32, ScratchError> {
        self.read_bits(32)
    }

    /// Fill `out` with the next bytes; works at any bit offset.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), ScratchError> {
        let requested = out.len() * 8;
        if requested > self.bits_remaining() {
            return Err(ScratchError::OutOfBounds {
                requested,
                remaining: self.bits_remaining(),
            });
        }
        if self.bit % 8 == 0 {
            let start = self.bit / 8;
            out.copy_from_slice(&self.bytes[start..start + out.len()]);
            self.bit += requested;
            return Ok(());
        }
        for byte in out.iter_mut() {
            *byte = self.read_u8()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_exposes_payload() {
        let mut scratch = ScratchBuffer::new(8);
        let payload = scratch.write(b"abc").unwrap();
        assert_eq!(payload.bytes(), b"abc");
        assert_eq!(payload.len(), 3);

        let payload = scratch.write(b"xy").unwrap();
        assert_eq!(payload.bytes(), b"xy");
    }

    #[test]
    fn test_overflow_rejected_not_truncated() {
        let mut scratch = ScratchBuffer::new(4);
        assert_eq!(scratch.write(&[1; 4]).unwrap().len(), 4);
        assert_eq!(
            scratch.write(&[1; 5]).unwrap_err(),
            ScratchError::Overflow {
                len: 5,
                capacity: 4
            }
        );
    }

    #[test]
    fn test_bit_reader_little_endian() {
        let bytes = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xFF];
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0x1234_5678);
        assert_eq!(reader.position(), 48);
        assert_eq!(reader.bits_remaining(), 8);
    }

    #[test]
    fn test_bit_reader_unaligned_fields() {
        // 0b1011_0101: bits LSB first are 1,0,1,0,1,1,0,1
        let bytes = [0b1011_0101, 0xAB];
        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_bits(3).unwrap(), 0b010);
        assert_eq!(reader.read_bits(4).unwrap(), 0b1011);
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert!(reader.read_bool().is_err());
    }

    #[test]
    fn test_read_bytes_at_offset() {
        let bytes = [0xF0, 0x0F, 0xF0];
        let mut reader = BitReader::new(&bytes);
        reader.read_bits(4).unwrap();
        let mut out = [0u8; 2];
        reader.read_bytes(&mut out).unwrap();
        assert_eq!(out, [0xFF, 0x00]);
        assert_eq!(reader.bits_remaining(), 4);

        let mut too_many = [0u8; 1];
        assert!(matches!(
            reader.read_bytes(&mut too_many),
            Err(ScratchError::OutOfBounds {
                requested: 8,
                remaining: 4
            })
        ));
    }

    #[test]
    fn test_payload_reader_starts_at_zero() {
        let mut scratch = ScratchBuffer::new(16);
        let payload = scratch.write(&[7, 0]).unwrap();
        let mut reader = payload.reader();
        assert_eq!(reader.read_u16().unwrap(), 7);
    }

    #[test]
    fn test_oversized_bit_read_is_an_error() {
        let bytes = [0xFF; 8];
        let mut reader = BitReader::new(&bytes);
        assert_eq!(
            reader.read_bits(33),
            Err(ScratchError::TooManyBits { requested: 33 })
        );
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_bits(32).unwrap(), u32::MAX);
    }
}
