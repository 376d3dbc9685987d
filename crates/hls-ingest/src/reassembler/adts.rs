//! ADTS AAC framing.

use bytes::Bytes;
use tracing::warn;

use super::{Framed, Scan};
use crate::error::{IngestError, Result};
use crate::format::{MIME_AAC, MediaFormat};

pub(crate) const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];
const SAMPLES_PER_FRAME: i64 = 1024;

pub(crate) fn is_sync(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && (data[1] & 0xF6) == 0xF0
}

/// Fields of an ADTS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AdtsHeader {
    pub header_len: usize,
    pub frame_len: usize,
    pub profile: u8,
    pub sampling_index: u8,
    pub channel_config: u8,
    pub raw_data_blocks: u8,
}

impl AdtsHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || !is_sync(data) {
            return None;
        }
        let protection_absent = data[1] & 0x01 != 0;
        let profile = data[2] >> 6;
        let sampling_index = (data[2] >> 2) & 0x0F;
        let channel_config = ((data[2] & 0x01) << 2) | (data[3] >> 6);
        let frame_len = (usize::from(data[3] & 0x03) << 11)
            | (usize::from(data[4]) << 3)
            | usize::from(data[5] >> 5);
        let raw_data_blocks = data[6] & 0x03;
        let header_len = if protection_absent { 7 } else { 9 };
        if usize::from(sampling_index) >= SAMPLE_RATES.len() || frame_len < header_len {
            return None;
        }
        Some(Self {
            header_len,
            frame_len,
            profile,
            sampling_index,
            channel_config,
            raw_data_blocks,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[usize::from(self.sampling_index)]
    }

    /// Two-byte AudioSpecificConfig.
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let object_type = self.profile + 1;
        [
            (object_type << 3) | (self.sampling_index >> 1),
            ((self.sampling_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }
}

/// Cut one raw AAC frame (header stripped) from the front of `data`.
pub(crate) fn scan(data: &[u8], need_format: bool) -> Result<Scan> {
    if data.len() < 7 {
        return Ok(Scan::NeedMore);
    }
    let Some(header) = AdtsHeader::parse(data) else {
        let next = data
            .windows(2)
            .skip(1)
            .position(is_sync)
            .map_or(data.len() - 1, |p| p + 1);
        return Ok(Scan::Skip(next));
    };
    if data.len() < header.frame_len {
        return Ok(Scan::NeedMore);
    }
    if header.raw_data_blocks != 0 {
        warn!(blocks = header.raw_data_blocks + 1, "Dropping multi-block ADTS frame");
        return Ok(Scan::Invalid(
            header.frame_len,
            IngestError::malformed("ADTS frames with multiple raw data blocks are not supported"),
        ));
    }

    let sample_rate = header.sample_rate();
    let format = need_format.then(|| {
        MediaFormat::audio(MIME_AAC, sample_rate, u32::from(header.channel_config))
            .with_csd(vec![Bytes::copy_from_slice(&header.audio_specific_config())])
    });
    Ok(Scan::Unit(Framed {
        data: Bytes::copy_from_slice(&data[header.header_len..header.frame_len]),
        consumed: header.frame_len,
        is_sync: true,
        sei: Vec::new(),
        format,
        duration_us: Some(SAMPLES_PER_FRAME * 1_000_000 / i64::from(sample_rate)),
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// ADTS frame (AAC LC, no CRC) around `payload`.
    pub(crate) fn adts_frame(sampling_index: u8, channels: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() + 7;
        let mut frame = vec![
            0xFF,
            0xF1,
            (1 << 6) | (sampling_index << 2) | (channels >> 2),
            ((channels & 0x03) << 6) | ((len >> 11) as u8 & 0x03),
            (len >> 3) as u8,
            (((len & 0x07) as u8) << 5) | 0x1F,
            0xFC,
        ];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn parses_header_and_config() {
        let frame = adts_frame(4, 2, &[0x21; 20]);
        let header = AdtsHeader::parse(&frame).unwrap();
        assert_eq!(header.frame_len, 27);
        assert_eq!(header.sample_rate(), 44100);
        assert_eq!(header.audio_specific_config(), [0x12, 0x10]);

        let Scan::Unit(unit) = scan(&frame, true).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(unit.data.len(), 20);
        assert_eq!(unit.consumed, 27);
        assert_eq!(unit.duration_us, Some(23_219));
        let format = unit.format.unwrap();
        assert_eq!(format.channels, Some(2));
    }

    #[test]
    fn resyncs_and_waits() {
        let mut data = vec![0x00, 0x12, 0x34];
        data.extend(adts_frame(3, 2, &[0x21; 10]));
        assert!(matches!(scan(&data, false).unwrap(), Scan::Skip(3)));
        assert!(matches!(scan(&data[3..10], false).unwrap(), Scan::NeedMore));
    }

    #[test]
    fn rejects_multiple_raw_blocks() {
        let mut frame = adts_frame(3, 2, &[0x21; 10]);
        frame[6] |= 0x01;
        assert!(matches!(scan(&frame, false).unwrap(), Scan::Invalid(17, _)));
    }
}
