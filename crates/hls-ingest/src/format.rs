use bytes::Bytes;

pub const MIME_AVC: &str = "video/avc";
pub const MIME_HEVC: &str = "video/hevc";
pub const MIME_MPEG2_VIDEO: &str = "video/mpeg2";
pub const MIME_MPEG4_VIDEO: &str = "video/mp4v-es";
pub const MIME_AAC: &str = "audio/mp4a-latm";
pub const MIME_MPEG_AUDIO: &str = "audio/mpeg";
pub const MIME_MPEG_AUDIO_L1: &str = "audio/mpeg-L1";
pub const MIME_MPEG_AUDIO_L2: &str = "audio/mpeg-L2";
pub const MIME_AC3: &str = "audio/ac3";
pub const MIME_EAC3: &str = "audio/eac3";
pub const MIME_DTS: &str = "audio/vnd.dts";
pub const MIME_DTS_HD: &str = "audio/vnd.dts.hd";
pub const MIME_RAW_AUDIO: &str = "audio/raw";
pub const MIME_ID3: &str = "application/id3";
pub const MIME_WEBVTT: &str = "text/vtt";

/// Description of an elementary stream, derived lazily from its first
/// complete access unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaFormat {
    pub mime: &'static str,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Codec configuration units (SPS/PPS, VPS/SPS/PPS, AudioSpecificConfig).
    pub codec_specific_data: Vec<Bytes>,
}

impl MediaFormat {
    pub fn new(mime: &'static str) -> Self {
        Self {
            mime,
            ..Default::default()
        }
    }

    pub fn audio(mime: &'static str, sample_rate: u32, channels: u32) -> Self {
        Self {
            mime,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            ..Default::default()
        }
    }

    pub fn video(mime: &'static str, width: u32, height: u32) -> Self {
        Self {
            mime,
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn with_csd(mut self, csd: Vec<Bytes>) -> Self {
        self.codec_specific_data = csd;
        self
    }

    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }

    pub fn is_hevc(&self) -> bool {
        self.mime == MIME_HEVC
    }
}
