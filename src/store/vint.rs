//! Variable-byte integer codec shared by every on-disk structure
//!
//! Seven data bits per byte, least-significant group first. The high bit
//! is set on the final byte of a value.

use crate::error::{IndexError, Result};

pub const MAX_VINT_LEN: usize = 5;
pub const MAX_VLONG_LEN: usize = 10;

/// Encode a value into `buf`, returning the number of bytes used
pub fn write_vlong(value: u64, buf: &mut [u8; MAX_VLONG_LEN]) -> usize {
    let mut v = value;
    let mut n = 0;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf[n] = byte | 0x80;
            return n + 1;
        }
        buf[n] = byte;
        n += 1;
    }
}

/// Append a 32-bit value to a byte vector
pub fn encode_vint(value: u32, output: &mut Vec<u8>) {
    encode_vlong(value as u64, output)
}

/// Append a 64-bit value to a byte vector
pub fn encode_vlong(value: u64, output: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_VLONG_LEN];
    let n = write_vlong(value, &mut buf);
    output.extend_from_slice(&buf[..n]);
}

/// Encoded size of a value
pub fn vlong_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

pub fn decode_vint(input: &[u8], pos: &mut usize) -> Result<u32> {
    let value = decode_with_limit(input, pos, 28)?;
    u32::try_from(value).map_err(|_| IndexError::collapse("vint overflows 32 bits"))
}

pub fn decode_vlong(input: &[u8], pos: &mut usize) -> Result<u64> {
    decode_with_limit(input, pos, 63)
}

fn decode_with_limit(input: &[u8], pos: &mut usize, max_shift: u32) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;

    loop {
        let byte = *input
            .get(*pos)
            .ok_or_else(|| IndexError::collapse("unexpected end of variable-byte value"))?;
        *pos += 1;

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 != 0 {
            return Ok(result);
        }

        shift += 7;
        if shift > max_shift {
            return Err(IndexError::collapse("variable-byte value too large"));
        }
    }
}

/// Cursor over an in-memory byte slice
#[derive(Debug, Clone)]
pub struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_vint(&mut self) -> Result<u32> {
        decode_vint(self.data, &mut self.pos)
    }

    pub fn read_vlong(&mut self) -> Result<u64> {
        decode_vlong(self.data, &mut self.pos)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_slice(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_slice(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_vint()? as usize;
        let bytes = self.read_slice(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| IndexError::collapse("string is not valid utf-8"))
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| IndexError::collapse("read past end of buffer"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vint_boundaries() {
        for value in [0u32, 1, 127, 128, 16_383, 16_384, u32::MAX] {
            let mut buf = Vec::new();
            encode_vint(value, &mut buf);
            assert_eq!(buf.len(), vlong_len(value as u64));
            let mut pos = 0;
            assert_eq!(decode_vint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_vlong_max() {
        let mut buf = Vec::new();
        encode_vlong(u64::MAX, &mut buf);
        assert_eq!(buf.len(), MAX_VLONG_LEN);
        let mut pos = 0;
        assert_eq!(decode_vlong(&buf, &mut pos).unwrap(), u64::MAX);
    }

    #[test]
    fn test_terminator_on_last_byte() {
        let mut buf = Vec::new();
        encode_vint(300, &mut buf);
        assert_eq!(buf, vec![0x2C, 0x82]);
    }

    #[test]
    fn test_truncated_and_oversized() {
        let mut pos = 0;
        assert!(decode_vint(&[0x01, 0x02], &mut pos).is_err());

        let mut big = Vec::new();
        encode_vlong(1u64 << 40, &mut big);
        let mut pos = 0;
        assert!(matches!(
            decode_vint(&big, &mut pos),
            Err(IndexError::IndexCollapse(_))
        ));
    }

    #[test]
    fn test_slice_reader() {
        let mut buf = Vec::new();
        encode_vint(5, &mut buf);
        buf.extend_from_slice(b"hello");
        buf.extend_from_slice(&42u32.to_le_bytes());
        let mut reader = SliceReader::new(&buf);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_u32().unwrap(), 42);
        assert!(reader.is_empty());
        assert!(reader.read_vint().is_err());
    }
}
