//! DTS core and DTS-HD substream framing.
//!
//! The core sync word comes in four packings (16 or 14 bits per word, big or
//! little endian). Headers are normalized to the 16-bit big-endian layout
//! before their fields are read.

use bytes::{Bytes, BytesMut};
use expgolomb::BitReader;

use super::{Framed, Scan};
use crate::error::Result;
use crate::format::{MIME_DTS, MIME_DTS_HD, MediaFormat};

const SAMPLE_RATES: [u32; 16] = [
    0, 8000, 16000, 32000, 0, 0, 11025, 22050, 44100, 0, 0, 12000, 24000, 48000, 0, 0,
];
const AMODE_CHANNELS: [u32; 16] = [1, 2, 2, 2, 2, 3, 3, 4, 4, 5, 6, 6, 6, 7, 8, 8];
const HD_SYNC: [u8; 4] = [0x64, 0x58, 0x20, 0x25];
/// Bytes of packed stream needed to decode the core header fields.
const HEADER_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DtsPacking {
    Be16,
    Le16,
    Be14,
    Le14,
}

impl DtsPacking {
    pub fn detect(data: &[u8]) -> Option<Self> {
        match data {
            [0x7F, 0xFE, 0x80, 0x01, ..] => Some(Self::Be16),
            [0xFE, 0x7F, 0x01, 0x80, ..] => Some(Self::Le16),
            [0x1F, 0xFF, 0xE8, 0x00, 0x07, b, ..] if b & 0xF0 == 0xF0 => Some(Self::Be14),
            [0xFF, 0x1F, 0x00, 0xE8, b, 0x07, ..] if b & 0xF0 == 0xF0 => Some(Self::Le14),
            _ => None,
        }
    }

    fn is_14bit(self) -> bool {
        matches!(self, Self::Be14 | Self::Le14)
    }
}

pub(crate) fn is_hd_sync(data: &[u8]) -> bool {
    data.starts_with(&HD_SYNC)
}

pub(crate) fn is_sync(data: &[u8]) -> bool {
    DtsPacking::detect(data).is_some() || is_hd_sync(data)
}

/// Repack the start of a core frame as 16-bit big-endian words.
fn normalize(data: &[u8], packing: DtsPacking) -> Vec<u8> {
    let words = data
        .chunks_exact(2)
        .map(|w| match packing {
            DtsPacking::Be16 | DtsPacking::Be14 => u16::from_be_bytes([w[0], w[1]]),
            DtsPacking::Le16 | DtsPacking::Le14 => u16::from_le_bytes([w[0], w[1]]),
        });
    if !packing.is_14bit() {
        return words.flat_map(u16::to_be_bytes).collect();
    }
    let mut out = Vec::with_capacity(data.len());
    let mut acc = 0u32;
    let mut acc_bits = 0;
    for word in words {
        acc = (acc << 14) | u32::from(word & 0x3FFF);
        acc_bits += 14;
        while acc_bits >= 8 {
            acc_bits -= 8;
            out.push((acc >> acc_bits) as u8);
        }
        acc &= (1 << acc_bits) - 1;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DtsCoreHeader {
    /// Frame length in the packed stream.
    pub frame_len: usize,
    pub sample_rate: u32,
    pub channels: u32,
    pub samples: u32,
}

impl DtsCoreHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let packing = DtsPacking::detect(data)?;
        let head = data.get(..HEADER_BYTES)?;
        let header = normalize(head, packing);
        let mut bits = BitReader::new(&header);
        bits.skip_bits(32).ok()?; // sync
        bits.skip_bits(1 + 5 + 1).ok()?; // FTYPE, SHORT, CPF
        let nblks = bits.read_bits(7).ok()? as u32;
        let fsize = bits.read_bits(14).ok()? as usize;
        let amode = bits.read_bits(6).ok()? as usize;
        let sfreq = bits.read_bits(4).ok()? as usize;
        if fsize < 95 {
            return None;
        }
        let sample_rate = SAMPLE_RATES[sfreq];
        if sample_rate == 0 {
            return None;
        }
        let core_len = fsize + 1;
        let frame_len = if packing.is_14bit() {
            core_len * 16 / 14
        } else {
            core_len
        };
        Some(Self {
            frame_len,
            sample_rate,
            channels: AMODE_CHANNELS.get(amode).copied().unwrap_or(2),
            samples: (nblks + 1) * 32,
        })
    }
}

/// Size of the DTS-HD substream frame at the start of `data`.
pub(crate) fn hd_frame_len(data: &[u8]) -> Option<usize> {
    if !is_hd_sync(data) {
        return None;
    }
    let mut bits = BitReader::new(data.get(4..12)?);
    bits.skip_bits(8 + 2).ok()?; // UserDefinedBits, nExtSSIndex
    let (header_bits, size_bits) = if bits.read_bit().ok()? { (12, 20) } else { (8, 16) };
    bits.skip_bits(header_bits).ok()?;
    let fsize = bits.read_bits(size_bits).ok()? as usize + 1;
    Some(fsize)
}

pub(crate) fn scan(data: &[u8], eos: bool, need_format: bool) -> Result<Scan> {
    if data.len() < HEADER_BYTES {
        return Ok(Scan::NeedMore);
    }

    if is_hd_sync(data) {
        let Some(len) = hd_frame_len(data) else {
            return Ok(Scan::Skip(1));
        };
        if data.len() < len {
            return Ok(Scan::NeedMore);
        }
        return Ok(Scan::Unit(Framed {
            data: Bytes::copy_from_slice(&data[..len]),
            consumed: len,
            is_sync: true,
            sei: Vec::new(),
            format: need_format.then(|| MediaFormat::audio(MIME_DTS_HD, 48000, 2)),
            duration_us: None,
        }));
    }

    let Some(core) = DtsCoreHeader::parse(data) else {
        let next = (1..data.len() - 3)
            .find(|&i| is_sync(&data[i..]))
            .unwrap_or(data.len() - 3);
        return Ok(Scan::Skip(next));
    };
    if data.len() < core.frame_len {
        return Ok(Scan::NeedMore);
    }

    // An HD substream right after the core belongs to the same unit.
    let rest = &data[core.frame_len..];
    let mut total = core.frame_len;
    let mut hd = false;
    if rest.len() < 4 && !eos {
        return Ok(Scan::NeedMore);
    }
    if is_hd_sync(rest) {
        match hd_frame_len(rest) {
            Some(len) if rest.len() >= len => {
                total += len;
                hd = true;
            }
            _ if !eos => return Ok(Scan::NeedMore),
            _ => {}
        }
    }

    let mut unit = BytesMut::with_capacity(total);
    unit.extend_from_slice(&data[..total]);
    let format = need_format.then(|| {
        let mime = if hd { MIME_DTS_HD } else { MIME_DTS };
        MediaFormat::audio(mime, core.sample_rate, core.channels)
    });
    Ok(Scan::Unit(Framed {
        data: unit.freeze(),
        consumed: total,
        is_sync: true,
        sei: Vec::new(),
        format,
        duration_us: Some(i64::from(core.samples) * 1_000_000 / i64::from(core.sample_rate)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 16-bit big-endian core frame: 16 blocks, `fsize + 1` bytes, 48 kHz
    /// stereo.
    fn core_frame(fsize: usize) -> Vec<u8> {
        // FTYPE(1) SHORT(5) CPF(1) NBLKS(7) FSIZE(14) AMODE(6) SFREQ(4)
        let fields: u64 =
            (1 << 37) | (31 << 32) | (15 << 24) | ((fsize as u64) << 10) | (2 << 4) | 13;
        let mut frame = vec![0x7F, 0xFE, 0x80, 0x01];
        frame.extend_from_slice(&(fields << (64 - 38)).to_be_bytes()[..5]);
        frame.resize(fsize + 1, 0);
        frame
    }

    #[test]
    fn detects_packings() {
        assert_eq!(DtsPacking::detect(&[0x7F, 0xFE, 0x80, 0x01]), Some(DtsPacking::Be16));
        assert_eq!(DtsPacking::detect(&[0xFE, 0x7F, 0x01, 0x80]), Some(DtsPacking::Le16));
        assert_eq!(
            DtsPacking::detect(&[0x1F, 0xFF, 0xE8, 0x00, 0x07, 0xF1]),
            Some(DtsPacking::Be14)
        );
        assert_eq!(
            DtsPacking::detect(&[0xFF, 0x1F, 0x00, 0xE8, 0xF1, 0x07]),
            Some(DtsPacking::Le14)
        );
        assert!(is_hd_sync(&HD_SYNC));
    }

    #[test]
    fn core_frame_with_hd_extension() {
        let mut data = core_frame(1023);
        let core = DtsCoreHeader::parse(&data).unwrap();
        assert_eq!(core.frame_len, 1024);
        assert_eq!(core.sample_rate, 48000);
        assert_eq!(core.samples, 512);

        // HD substream: header size type 0, fsize 63 -> 64 bytes.
        let mut hd = HD_SYNC.to_vec();
        // UserDefinedBits(8) nExtSSIndex(2) bHeaderSizeType(1) header(8) fsize(16)
        let fields: u64 = 63 << (64 - 35);
        hd.extend_from_slice(&fields.to_be_bytes()[..5]);
        hd.resize(64, 0);
        assert_eq!(hd_frame_len(&hd), Some(64));
        data.extend_from_slice(&hd);

        let Scan::Unit(unit) = scan(&data, false, true).unwrap() else {
            panic!("expected unit");
        };
        assert_eq!(unit.consumed, 1088);
        assert_eq!(unit.format.unwrap().mime, MIME_DTS_HD);
    }

    #[test]
    fn little_endian_matches_big_endian() {
        let be = core_frame(1023);
        let le: Vec<u8> = be.chunks_exact(2).flat_map(|w| [w[1], w[0]]).collect();
        assert_eq!(DtsCoreHeader::parse(&le), DtsCoreHeader::parse(&be));
    }
}
