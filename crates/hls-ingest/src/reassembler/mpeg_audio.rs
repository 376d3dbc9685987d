//! MPEG-1/2/2.5 audio (layers I-III) framing.

use bytes::Bytes;

use super::{Framed, Scan};
use crate::error::Result;
use crate::format::{MIME_MPEG_AUDIO, MIME_MPEG_AUDIO_L1, MIME_MPEG_AUDIO_L2, MediaFormat};

const BITRATE_V1_L1: [u32; 14] = [32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATE_V1_L2: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATE_V1_L3: [u32; 14] = [32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATE_V2_L1: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATE_V2_L23: [u32; 14] = [8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];
const SAMPLE_RATES_V1: [u32; 3] = [44100, 48000, 32000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MpegAudioHeader {
    pub frame_len: usize,
    pub sample_rate: u32,
    pub channels: u32,
    pub samples: u32,
    pub layer: u8,
}

impl MpegAudioHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 || data[0] != 0xFF || (data[1] & 0xE0) != 0xE0 {
            return None;
        }
        let version = (data[1] >> 3) & 0x03; // 0: 2.5, 2: 2, 3: 1
        let layer = match (data[1] >> 1) & 0x03 {
            3 => 1,
            2 => 2,
            1 => 3,
            _ => return None,
        };
        let bitrate_index = usize::from(data[2] >> 4);
        let sr_index = usize::from((data[2] >> 2) & 0x03);
        if version == 1 || bitrate_index == 0 || bitrate_index == 15 || sr_index == 3 {
            return None;
        }
        let padding = u32::from((data[2] >> 1) & 0x01);
        let channels = if data[3] >> 6 == 3 { 1 } else { 2 };

        let v1 = version == 3;
        let table = match (v1, layer) {
            (true, 1) => &BITRATE_V1_L1,
            (true, 2) => &BITRATE_V1_L2,
            (true, _) => &BITRATE_V1_L3,
            (false, 1) => &BITRATE_V2_L1,
            (false, _) => &BITRATE_V2_L23,
        };
        let bitrate = table[bitrate_index - 1] * 1000;
        let sample_rate = match version {
            3 => SAMPLE_RATES_V1[sr_index],
            2 => SAMPLE_RATES_V1[sr_index] / 2,
            _ => SAMPLE_RATES_V1[sr_index] / 4,
        };

        let (frame_len, samples) = match layer {
            1 => ((12 * bitrate / sample_rate + padding) * 4, 384),
            2 => (144 * bitrate / sample_rate + padding, 1152),
            _ if v1 => (144 * bitrate / sample_rate + padding, 1152),
            _ => (72 * bitrate / sample_rate + padding, 576),
        };
        Some(Self {
            frame_len: frame_len as usize,
            sample_rate,
            channels,
            samples,
            layer,
        })
    }

    fn mime(&self) -> &'static str {
        match self.layer {
            1 => MIME_MPEG_AUDIO_L1,
            2 => MIME_MPEG_AUDIO_L2,
            _ => MIME_MPEG_AUDIO,
        }
    }
}

pub(crate) fn scan(data: &[u8], need_format: bool) -> Result<Scan> {
    if data.len() < 4 {
        return Ok(Scan::NeedMore);
    }
    let Some(header) = MpegAudioHeader::parse(data) else {
        let next = (1..data.len())
            .find(|&i| data[i] == 0xFF && MpegAudioHeader::parse(&data[i..]).is_some())
            .unwrap_or(data.len().saturating_sub(3));
        return Ok(Scan::Skip(next.max(1)));
    };
    if data.len() < header.frame_len {
        return Ok(Scan::NeedMore);
    }
    let format = need_format
        .then(|| MediaFormat::audio(header.mime(), header.sample_rate, header.channels));
    Ok(Scan::Unit(Framed {
        data: Bytes::copy_from_slice(&data[..header.frame_len]),
        consumed: header.frame_len,
        is_sync: true,
        sei: Vec::new(),
        format,
        duration_us: Some(i64::from(header.samples) * 1_000_000 / i64::from(header.sample_rate)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer3_frame_size() {
        // MPEG-1 layer III, 128 kbps, 44.1 kHz, no padding, stereo.
        let mut frame = vec![0xFF, 0xFB, 0x90, 0x00];
        frame.resize(417, 0x55);
        let header = MpegAudioHeader::parse(&frame).unwrap();
        assert_eq!(header.frame_len, 417);
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.channels, 2);

        let Scan::Unit(unit) = scan(&frame, true).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(unit.consumed, 417);
        assert_eq!(unit.format.unwrap().mime, MIME_MPEG_AUDIO);
        assert!(matches!(scan(&frame[..200], false).unwrap(), Scan::NeedMore));
    }

    #[test]
    fn rejects_free_format_and_reserved() {
        assert!(MpegAudioHeader::parse(&[0xFF, 0xFB, 0x00, 0x00]).is_none());
        assert!(MpegAudioHeader::parse(&[0xFF, 0xFB, 0x9C, 0x00]).is_none());
        assert!(MpegAudioHeader::parse(&[0xFF, 0xE9, 0x90, 0x00]).is_none());
    }
}
