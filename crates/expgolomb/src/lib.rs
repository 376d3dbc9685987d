//! Bit-level reading for H.264 / H.265 bitstreams.
//!
//! Provides an MSB-first [`BitReader`] with Exp-Golomb `ue(v)` / `se(v)`
//! decoding, plus [`rbsp_from_ebsp`] to strip emulation prevention bytes
//! from a NAL unit payload before parsing it.

use std::io;

/// MSB-first reader over a byte slice.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Number of bits left to read.
    pub fn remaining_bits(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.bit_pos)
    }

    /// Current position in bits from the start of the slice.
    pub fn position(&self) -> usize {
        self.bit_pos
    }

    pub fn is_aligned(&self) -> bool {
        self.bit_pos % 8 == 0
    }

    pub fn read_bit(&mut self) -> io::Result<bool> {
        let byte = self
            .data
            .get(self.bit_pos / 8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "bit reader exhausted"))?;
        let bit = (byte >> (7 - (self.bit_pos % 8))) & 1;
        self.bit_pos += 1;
        Ok(bit == 1)
    }

    /// Read up to 64 bits as an unsigned integer.
    pub fn read_bits(&mut self, count: u8) -> io::Result<u64> {
        if count > 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read more than 64 bits at once",
            ));
        }
        if self.remaining_bits() < count as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bit reader exhausted",
            ));
        }

        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn skip_bits(&mut self, count: usize) -> io::Result<()> {
        if self.remaining_bits() < count {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bit reader exhausted",
            ));
        }
        self.bit_pos += count;
        Ok(())
    }

    /// Unsigned Exp-Golomb code, `ue(v)`.
    pub fn read_exp_golomb(&mut self) -> io::Result<u64> {
        let mut leading_zeros = 0u8;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 63 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "exp-golomb code too long",
                ));
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok((1u64 << leading_zeros) - 1 + suffix)
    }

    /// Signed Exp-Golomb code, `se(v)`.
    pub fn read_signed_exp_golomb(&mut self) -> io::Result<i64> {
        let code = self.read_exp_golomb()?;
        if code % 2 == 0 {
            Ok(-((code / 2) as i64))
        } else {
            Ok(code.div_ceil(2) as i64)
        }
    }
}

/// Remove `0x000003` emulation prevention bytes, turning an encapsulated
/// byte sequence payload into its raw byte sequence payload.
pub fn rbsp_from_ebsp(ebsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ebsp.len());
    let mut zeros = 0usize;
    for &byte in ebsp {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Write `value` as ue(v) into a bit vector.
    fn encode_ue(value: u64, bits: &mut Vec<bool>) {
        let code = value + 1;
        let len = 64 - code.leading_zeros() as usize;
        bits.extend(std::iter::repeat_n(false, len - 1));
        for i in (0..len).rev() {
            bits.push((code >> i) & 1 == 1);
        }
    }

    fn pack(bits: &[bool]) -> Vec<u8> {
        let mut out = vec![0u8; bits.len().div_ceil(8)];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                out[i / 8] |= 0x80 >> (i % 8);
            }
        }
        out
    }

    #[test]
    fn reads_fixed_width_fields() {
        let data = [0b1010_1100, 0xFF];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits(5).unwrap(), 0b01100);
        assert!(reader.is_aligned());
        assert_eq!(reader.read_u8().unwrap(), 0xFF);
        assert!(reader.read_bit().is_err());
    }

    #[test]
    fn decodes_known_exp_golomb_codes() {
        // 1 -> 0, 010 -> 1, 011 -> 2, 00100 -> 3
        let data = [0b1010_0110, 0b0100_0000];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_exp_golomb().unwrap(), 0);
        assert_eq!(reader.read_exp_golomb().unwrap(), 1);
        assert_eq!(reader.read_exp_golomb().unwrap(), 2);
        assert_eq!(reader.read_exp_golomb().unwrap(), 3);
    }

    #[test]
    fn signed_exp_golomb_alternates_sign() {
        // codes 1, 2, 3, 4 map to +1, -1, +2, -2
        let mut bits = Vec::new();
        for v in [1, 2, 3, 4] {
            encode_ue(v, &mut bits);
        }
        let data = pack(&bits);
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_signed_exp_golomb().unwrap(), 1);
        assert_eq!(reader.read_signed_exp_golomb().unwrap(), -1);
        assert_eq!(reader.read_signed_exp_golomb().unwrap(), 2);
        assert_eq!(reader.read_signed_exp_golomb().unwrap(), -2);
    }

    #[test]
    fn strips_emulation_prevention() {
        let ebsp = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x42];
        assert_eq!(rbsp_from_ebsp(&ebsp), vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x42]);
    }

    proptest! {
        #[test]
        fn exp_golomb_decodes_what_was_encoded(values in proptest::collection::vec(0u64..100_000, 1..32)) {
            let mut bits = Vec::new();
            for v in &values {
                encode_ue(*v, &mut bits);
            }
            let data = pack(&bits);
            let mut reader = BitReader::new(&data);
            for v in values {
                prop_assert_eq!(reader.read_exp_golomb().unwrap(), v);
            }
        }
    }
}
