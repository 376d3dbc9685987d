use m3u8_rs::{AlternativeMediaType, MasterPlaylist};
use tracing::warn;
use url::Url;

use crate::error::{IngestError, Result};
use crate::stream::{StreamMask, StreamType};

const VIDEO_CODECS: &[&str] = &["avc1", "avc3", "hvc1", "hev1", "mp4v"];
const AUDIO_CODECS: &[&str] = &["mp4a", "ac-3", "ec-3", "mp3", "dts", "dtsc", "dtsh", "dtsl"];

/// Stream types announced by a `CODECS` attribute. Absent codecs means the
/// variant carries both audio and video.
pub fn stream_mask_from_codecs(codecs: Option<&str>) -> StreamMask {
    let Some(codecs) = codecs else {
        return StreamMask::AUDIO | StreamMask::VIDEO;
    };
    let mut mask = StreamMask::empty();
    for codec in codecs.split(',') {
        let family = codec
            .trim()
            .split('.')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if VIDEO_CODECS.contains(&family.as_str()) {
            mask |= StreamMask::VIDEO;
        } else if AUDIO_CODECS.contains(&family.as_str()) {
            mask |= StreamMask::AUDIO;
        }
    }
    if mask.is_empty() {
        // Unrecognized codec list; assume muxed content.
        mask = StreamMask::AUDIO | StreamMask::VIDEO;
    }
    mask
}

/// One `EXT-X-STREAM-INF` rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// Position in the playlist as listed.
    pub listed_index: usize,
    pub uri: Url,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub resolution: Option<(u64, u64)>,
    pub audio_group: Option<String>,
    pub subtitle_group: Option<String>,
    /// Streams carried by `uri` itself.
    pub stream_mask: StreamMask,
}

/// Variants sorted ascending by bandwidth.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantTable {
    variants: Vec<Variant>,
    initial_index: usize,
    is_variant_playlist: bool,
}

impl VariantTable {
    pub fn from_master(master: &MasterPlaylist, base: &Url) -> Self {
        let mut variants = Vec::with_capacity(master.variants.len());
        for (listed_index, stream) in master.variants.iter().enumerate() {
            if stream.is_i_frame {
                continue;
            }
            let uri = match base.join(&stream.uri) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!(uri = %stream.uri, error = %e, "Skipping variant with invalid URI");
                    continue;
                }
            };
            variants.push(Variant {
                listed_index,
                uri,
                bandwidth: stream.bandwidth,
                codecs: stream.codecs.clone(),
                resolution: stream.resolution.as_ref().map(|r| (r.width, r.height)),
                audio_group: stream.audio.clone(),
                subtitle_group: stream.subtitles.clone(),
                stream_mask: stream_mask_from_codecs(stream.codecs.as_deref())
                    | StreamMask::METADATA,
            });
        }
        Self::from_variants(variants)
    }

    /// Build a table from variants in listed order.
    pub fn from_variants(mut variants: Vec<Variant>) -> Self {
        let first_listed = variants.iter().map(|v| v.listed_index).min();
        variants.sort_by_key(|v| (v.bandwidth, v.listed_index));
        let initial_index = first_listed
            .and_then(|listed| variants.iter().position(|v| v.listed_index == listed))
            .unwrap_or(0);
        Self {
            variants,
            initial_index,
            is_variant_playlist: true,
        }
    }

    /// Table with one dummy variant for a plain media playlist.
    pub fn single(uri: Url) -> Self {
        Self {
            variants: vec![Variant {
                listed_index: 0,
                uri,
                bandwidth: 0,
                codecs: None,
                resolution: None,
                audio_group: None,
                subtitle_group: None,
                stream_mask: StreamMask::AUDIO | StreamMask::VIDEO | StreamMask::METADATA,
            }],
            initial_index: 0,
            is_variant_playlist: false,
        }
    }

    /// Index of the first-listed variant, the provider's preferred default.
    pub fn initial_index(&self) -> usize {
        self.initial_index
    }

    pub fn is_variant_playlist(&self) -> bool {
        self.is_variant_playlist
    }

    pub fn get(&self, index: usize) -> Option<&Variant> {
        self.variants.get(index)
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variant> {
        self.variants.iter()
    }

    pub fn bandwidth(&self, index: usize) -> u64 {
        self.variants.get(index).map_or(0, |v| v.bandwidth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Subtitle,
}

impl TrackKind {
    pub fn stream_type(self) -> StreamType {
        match self {
            TrackKind::Audio => StreamType::Audio,
            TrackKind::Subtitle => StreamType::Subtitle,
        }
    }
}

/// One `EXT-X-MEDIA` alternative rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub index: usize,
    pub kind: TrackKind,
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    /// `None` when the rendition is muxed into the variant stream.
    pub uri: Option<Url>,
    pub default: bool,
    pub autoselect: bool,
    pub selected: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackList {
    tracks: Vec<TrackInfo>,
}

impl TrackList {
    pub fn from_master(master: &MasterPlaylist, base: &Url) -> Self {
        let mut tracks: Vec<TrackInfo> = Vec::new();
        for media in &master.alternatives {
            let kind = match media.media_type {
                AlternativeMediaType::Audio => TrackKind::Audio,
                AlternativeMediaType::Subtitles => TrackKind::Subtitle,
                _ => continue,
            };
            let uri = match media.uri.as_deref().map(|u| base.join(u)) {
                None => None,
                Some(Ok(uri)) => Some(uri),
                Some(Err(e)) => {
                    warn!(name = %media.name, error = %e, "Skipping rendition with invalid URI");
                    continue;
                }
            };
            tracks.push(TrackInfo {
                index: tracks.len(),
                kind,
                group_id: media.group_id.clone(),
                name: media.name.clone(),
                language: media.language.clone(),
                uri,
                default: media.default,
                autoselect: media.autoselect,
                selected: false,
            });
        }
        let mut list = Self { tracks };
        list.select_defaults();
        list
    }

    pub fn from_tracks(tracks: Vec<TrackInfo>) -> Self {
        let mut list = Self { tracks };
        for (i, track) in list.tracks.iter_mut().enumerate() {
            track.index = i;
        }
        list.select_defaults();
        list
    }

    /// One selected track per audio group (default, else autoselect, else
    /// the first); subtitles only when marked default.
    fn select_defaults(&mut self) {
        let groups: Vec<(TrackKind, String)> = self
            .tracks
            .iter()
            .map(|t| (t.kind, t.group_id.clone()))
            .fold(Vec::new(), |mut acc, key| {
                if !acc.contains(&key) {
                    acc.push(key);
                }
                acc
            });
        for (kind, group) in groups {
            let members = || {
                self.tracks
                    .iter()
                    .filter(|t| t.kind == kind && t.group_id == group)
            };
            let pick = members()
                .find(|t| t.default)
                .or_else(|| members().find(|t| t.autoselect && kind == TrackKind::Audio))
                .or_else(|| members().find(|_| kind == TrackKind::Audio))
                .map(|t| t.index);
            if let Some(index) = pick {
                self.tracks[index].selected = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn track_info(&self) -> &[TrackInfo] {
        &self.tracks
    }

    pub fn get(&self, index: usize) -> Option<&TrackInfo> {
        self.tracks.get(index)
    }

    /// Selected track of `kind` within `group`, if any.
    pub fn selected_track(&self, kind: TrackKind, group: Option<&str>) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| {
            t.kind == kind && t.selected && group.is_none_or(|g| t.group_id == g)
        })
    }

    /// (De)select a track. Selecting deselects the other members of its
    /// group. Audio tracks cannot be deselected.
    ///
    /// Returns whether anything changed.
    pub fn select(&mut self, index: usize, select: bool) -> Result<bool> {
        let track = self
            .tracks
            .get(index)
            .ok_or_else(|| IngestError::invalid_operation(format!("no track at index {index}")))?;
        if track.selected == select {
            return Ok(false);
        }
        let (kind, group) = (track.kind, track.group_id.clone());
        if !select {
            if kind == TrackKind::Audio {
                return Err(IngestError::invalid_operation(
                    "audio tracks cannot be deselected",
                ));
            }
            self.tracks[index].selected = false;
            return Ok(true);
        }
        for track in &mut self.tracks {
            if track.kind == kind && track.group_id == group {
                track.selected = track.index == index;
            }
        }
        Ok(true)
    }
}
