//! LPCM and timed metadata passthrough.

use bytes::{Bytes, BytesMut};
use expgolomb::BitReader;

use super::{Framed, Scan};
use crate::error::{IngestError, Result};
use crate::format::{MIME_ID3, MIME_RAW_AUDIO, MediaFormat};

pub(crate) const PCM_HEADER_MARKER: u8 = 0xA0;
const PCM_HEADER_LEN: usize = 4;
const PCM_FRAMES_PER_UNIT: usize = 80;
const PCM_SAMPLE_RATE: u32 = 48000;

/// Header of a PCM access unit group: `0xA0`, unit count, reserved byte,
/// then quantization(2) sampling frequency(3) channels(3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PcmHeader {
    units: usize,
    channels: usize,
}

impl PcmHeader {
    fn parse(data: &[u8]) -> Result<Option<Self>> {
        let Some(header) = data.get(..PCM_HEADER_LEN) else {
            return Ok(None);
        };
        let mut bits = BitReader::new(header);
        let marker = bits.read_u8().map_err(|e| IngestError::malformed(e.to_string()))?;
        if marker != PCM_HEADER_MARKER {
            return Err(IngestError::malformed(format!(
                "PCM header marker {marker:#04x} (expected 0xa0)"
            )));
        }
        let read = |bits: &mut BitReader<'_>, n| {
            bits.read_bits(n)
                .map_err(|e| IngestError::malformed(e.to_string()))
        };
        let units = read(&mut bits, 8)? as usize;
        read(&mut bits, 8)?;
        read(&mut bits, 2)?; // quantization_word_length
        let frequency = read(&mut bits, 3)?;
        let channels = read(&mut bits, 3)?;
        if frequency != 2 {
            return Err(IngestError::malformed(format!(
                "unsupported PCM sampling frequency code {frequency}"
            )));
        }
        if channels != 1 {
            return Err(IngestError::malformed(format!(
                "unsupported PCM channel code {channels}"
            )));
        }
        Ok(Some(Self {
            units,
            channels: 2,
        }))
    }

    fn payload_len(&self) -> usize {
        self.units * PCM_FRAMES_PER_UNIT * self.channels * 2
    }
}

/// One PCM unit group; big-endian samples are converted to little endian.
pub(crate) fn scan_pcm(data: &[u8], need_format: bool) -> Result<Scan> {
    let header = match PcmHeader::parse(data) {
        Ok(Some(header)) => header,
        Ok(None) => return Ok(Scan::NeedMore),
        Err(e) => return Ok(Scan::Invalid(data.len(), e)),
    };
    let total = PCM_HEADER_LEN + header.payload_len();
    if data.len() < total {
        return Ok(Scan::NeedMore);
    }

    let mut out = BytesMut::with_capacity(header.payload_len());
    for sample in data[PCM_HEADER_LEN..total].chunks_exact(2) {
        out.extend_from_slice(&[sample[1], sample[0]]);
    }
    let frames = header.units * PCM_FRAMES_PER_UNIT;
    Ok(Scan::Unit(Framed {
        data: out.freeze(),
        consumed: total,
        is_sync: true,
        sei: Vec::new(),
        format: need_format.then(|| {
            MediaFormat::audio(MIME_RAW_AUDIO, PCM_SAMPLE_RATE, header.channels as u32)
        }),
        duration_us: Some(frames as i64 * 1_000_000 / i64::from(PCM_SAMPLE_RATE)),
    }))
}

/// Emit whatever one append contributed, unchanged.
pub(crate) fn scan_metadata(data: &[u8], append_len: Option<usize>, need_format: bool) -> Scan {
    let Some(len) = append_len.filter(|len| *len <= data.len()) else {
        return Scan::NeedMore;
    };
    Scan::Unit(Framed {
        data: Bytes::copy_from_slice(&data[..len]),
        consumed: len,
        is_sync: true,
        sei: Vec::new(),
        format: need_format.then(|| MediaFormat::new(MIME_ID3)),
        duration_us: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_swaps_sample_bytes() {
        // One unit: 80 stereo frames of 16-bit samples.
        let mut data = vec![0xA0, 0x01, 0x00, 0b00_010_001];
        for i in 0..(80 * 2) {
            data.extend_from_slice(&[0x12, i as u8]);
        }
        let Scan::Unit(unit) = scan_pcm(&data, true).unwrap() else {
            panic!("expected unit");
        };
        assert_eq!(unit.consumed, 4 + 320);
        assert_eq!(&unit.data[..4], &[0x00, 0x12, 0x01, 0x12]);
        assert_eq!(unit.duration_us, Some(1_666));
        assert!(matches!(scan_pcm(&data[..100], false).unwrap(), Scan::NeedMore));
    }

    #[test]
    fn pcm_rejects_bad_header() {
        let data = [0xA1, 0x01, 0x00, 0x11];
        assert!(matches!(scan_pcm(&data, false).unwrap(), Scan::Invalid(4, _)));
    }
}
