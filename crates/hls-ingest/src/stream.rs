use std::fmt;

use bitflags::bitflags;

/// Logical stream carried by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamType {
    Audio,
    Video,
    Subtitle,
    Metadata,
}

impl StreamType {
    pub const ALL: [StreamType; 4] = [
        StreamType::Audio,
        StreamType::Video,
        StreamType::Subtitle,
        StreamType::Metadata,
    ];

    pub fn index(self) -> usize {
        match self {
            StreamType::Audio => 0,
            StreamType::Video => 1,
            StreamType::Subtitle => 2,
            StreamType::Metadata => 3,
        }
    }

    pub fn mask(self) -> StreamMask {
        match self {
            StreamType::Audio => StreamMask::AUDIO,
            StreamType::Video => StreamMask::VIDEO,
            StreamType::Subtitle => StreamMask::SUBTITLE,
            StreamType::Metadata => StreamMask::METADATA,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
            StreamType::Subtitle => "subtitle",
            StreamType::Metadata => "metadata",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

bitflags! {
    /// Set of stream types a fetcher or queue set carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamMask: u8 {
        const AUDIO = 1 << 0;
        const VIDEO = 1 << 1;
        const SUBTITLE = 1 << 2;
        const METADATA = 1 << 3;
    }
}

impl StreamMask {
    /// Stream types contained in the mask, in [`StreamType::ALL`] order.
    pub fn types(self) -> impl Iterator<Item = StreamType> {
        StreamType::ALL
            .into_iter()
            .filter(move |t| self.contains(t.mask()))
    }

    pub fn has(self, stream: StreamType) -> bool {
        self.contains(stream.mask())
    }
}

impl From<StreamType> for StreamMask {
    fn from(value: StreamType) -> Self {
        value.mask()
    }
}

impl FromIterator<StreamType> for StreamMask {
    fn from_iter<I: IntoIterator<Item = StreamType>>(iter: I) -> Self {
        iter.into_iter()
            .fold(StreamMask::empty(), |mask, t| mask | t.mask())
    }
}
