//! AC-3 and E-AC-3 (Dolby Digital / Digital Plus) framing.

use bytes::Bytes;
use expgolomb::BitReader;

use super::{Framed, Scan};
use crate::error::Result;
use crate::format::{MIME_AC3, MIME_EAC3, MediaFormat};

/// Nominal bitrate in kbps per `frmsizecod / 2`.
const AC3_BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];
const AC3_SAMPLE_RATES: [u32; 3] = [48000, 44100, 32000];
const EAC3_REDUCED_SAMPLE_RATES: [u32; 3] = [24000, 22050, 16000];
const EAC3_BLOCKS: [u32; 4] = [1, 2, 3, 6];
/// Full-bandwidth channels per `acmod`.
const ACMOD_CHANNELS: [u32; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

pub(crate) fn is_sync(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x0B && data[1] == 0x77
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DdpHeader {
    pub frame_len: usize,
    pub sample_rate: u32,
    pub channels: u32,
    pub samples: u32,
    pub enhanced: bool,
}

/// AC-3 frame length in bytes for `fscod` and `frmsizecod`.
fn ac3_frame_len(fscod: u8, frmsizecod: u8) -> Option<usize> {
    let bitrate = *AC3_BITRATES.get(usize::from(frmsizecod / 2))?;
    let sample_rate = *AC3_SAMPLE_RATES.get(usize::from(fscod))?;
    let mut words = bitrate * 96_000 / sample_rate;
    if fscod == 1 && frmsizecod % 2 == 1 {
        words += 1;
    }
    Some(words as usize * 2)
}

impl DdpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || !is_sync(data) {
            return None;
        }
        let bsid = data[5] >> 3;
        if bsid <= 10 {
            Self::parse_ac3(data)
        } else if bsid <= 16 {
            Self::parse_eac3(data)
        } else {
            None
        }
    }

    fn parse_ac3(data: &[u8]) -> Option<Self> {
        let fscod = data[4] >> 6;
        let frmsizecod = data[4] & 0x3F;
        let frame_len = ac3_frame_len(fscod, frmsizecod)?;

        // bsi: bsid(5) bsmod(3) acmod(3) [cmixlev] [surmixlev] [dsurmod] lfeon
        let mut bits = BitReader::new(&data[5..]);
        bits.skip_bits(8).ok()?;
        let acmod = bits.read_bits(3).ok()? as usize;
        if acmod & 0x01 != 0 && acmod != 1 {
            bits.skip_bits(2).ok()?;
        }
        if acmod & 0x04 != 0 {
            bits.skip_bits(2).ok()?;
        }
        if acmod == 2 {
            bits.skip_bits(2).ok()?;
        }
        let lfe = u32::from(bits.read_bit().ok()?);

        Some(Self {
            frame_len,
            sample_rate: AC3_SAMPLE_RATES[usize::from(fscod)],
            channels: ACMOD_CHANNELS[acmod] + lfe,
            samples: 1536,
            enhanced: false,
        })
    }

    fn parse_eac3(data: &[u8]) -> Option<Self> {
        let frmsiz = (usize::from(data[2] & 0x07) << 8) | usize::from(data[3]);
        let fscod = data[4] >> 6;
        let (sample_rate, blocks) = if fscod == 3 {
            let fscod2 = usize::from((data[4] >> 4) & 0x03);
            (*EAC3_REDUCED_SAMPLE_RATES.get(fscod2)?, 6)
        } else {
            (
                AC3_SAMPLE_RATES[usize::from(fscod)],
                EAC3_BLOCKS[usize::from((data[4] >> 4) & 0x03)],
            )
        };
        let acmod = usize::from((data[4] >> 1) & 0x07);
        let lfe = u32::from(data[4] & 0x01);
        Some(Self {
            frame_len: (frmsiz + 1) * 2,
            sample_rate,
            channels: ACMOD_CHANNELS[acmod] + lfe,
            samples: blocks * 256,
            enhanced: true,
        })
    }
}

pub(crate) fn scan(data: &[u8], need_format: bool) -> Result<Scan> {
    if data.len() < 7 {
        return Ok(Scan::NeedMore);
    }
    let Some(header) = DdpHeader::parse(data) else {
        let next = (1..data.len() - 1)
            .find(|&i| is_sync(&data[i..]))
            .unwrap_or(data.len() - 1);
        return Ok(Scan::Skip(next));
    };
    if data.len() < header.frame_len {
        return Ok(Scan::NeedMore);
    }
    let format = need_format.then(|| {
        let mime = if header.enhanced { MIME_EAC3 } else { MIME_AC3 };
        MediaFormat::audio(mime, header.sample_rate, header.channels)
    });
    Ok(Scan::Unit(Framed {
        data: Bytes::copy_from_slice(&data[..header.frame_len]),
        consumed: header.frame_len,
        is_sync: true,
        sei: Vec::new(),
        format,
        duration_us: Some(i64::from(header.samples) * 1_000_000 / i64::from(header.sample_rate)),
    }))
}
