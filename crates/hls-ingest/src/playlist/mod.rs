//! Playlist adapter over `m3u8-rs`.
//!
//! Turns parsed master/media playlists into the flat view the fetchers and
//! the controller work with: absolute URIs, per-item discontinuity
//! sequence, inherited keys and resolved byte ranges.

mod variants;

pub use variants::{
    TrackInfo, TrackKind, TrackList, Variant, VariantTable, stream_mask_from_codecs,
};

use std::time::Duration;

use bytes::Bytes;
use m3u8_rs::{KeyMethod, MediaPlaylist, MediaPlaylistType, MediaSegment, parse_playlist_res};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::PlaylistConfig;
use crate::error::{IngestError, Result};
use crate::net::{ByteFetcher, ByteRange, FetchRequest, fetch_all};

/// Encryption attached to a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherInfo {
    pub key_uri: Url,
    /// Raw `IV` attribute, if the playlist declared one.
    pub iv: Option<String>,
}

/// One media segment of a media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentItem {
    pub uri: Url,
    pub seq: u64,
    pub duration_us: i64,
    /// Start of this item on the playlist timeline (sum of the preceding
    /// durations).
    pub start_us: i64,
    pub discontinuity: bool,
    pub discontinuity_seq: u32,
    pub cipher: Option<CipherInfo>,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistMeta {
    pub target_duration_us: i64,
    pub media_sequence: u64,
}

#[derive(Debug, Clone)]
enum PlaylistKind {
    Master {
        variants: VariantTable,
        tracks: TrackList,
    },
    Media {
        items: Vec<SegmentItem>,
        meta: PlaylistMeta,
        discontinuity_seq: u32,
        complete: bool,
        event: bool,
    },
}

/// Parsed playlist, master or media.
#[derive(Debug, Clone)]
pub struct PlaylistSnapshot {
    url: Url,
    kind: PlaylistKind,
}

/// True when the bytes look like an M3U8 document at all.
pub fn looks_like_m3u8(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..].starts_with(b"#EXTM3U")
}

impl PlaylistSnapshot {
    /// Parse playlist bytes fetched from `url` (the final URL after
    /// redirects, used to resolve relative references).
    pub fn parse(bytes: &[u8], url: &Url) -> Result<Self> {
        if !looks_like_m3u8(bytes) {
            return Err(IngestError::unsupported_source(format!(
                "{url} is not an M3U8 playlist"
            )));
        }
        let kind = match parse_playlist_res(bytes) {
            Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => PlaylistKind::Master {
                variants: VariantTable::from_master(&master, url),
                tracks: TrackList::from_master(&master, url),
            },
            Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => Self::media_kind(&media, url)?,
            Err(e) => {
                return Err(IngestError::playlist(format!(
                    "failed to parse playlist {url}: {e}"
                )));
            }
        };
        Ok(Self {
            url: url.clone(),
            kind,
        })
    }

    fn media_kind(media: &MediaPlaylist, base: &Url) -> Result<PlaylistKind> {
        let base_disc = u32::try_from(media.discontinuity_sequence).unwrap_or(u32::MAX);
        let mut items = Vec::with_capacity(media.segments.len());
        let mut disc_seq = base_disc;
        let mut start_us = 0i64;
        let mut current_key: Option<CipherInfo> = None;
        let mut last_range: Option<(Url, u64)> = None;

        for (idx, segment) in media.segments.iter().enumerate() {
            let seq = media.media_sequence + idx as u64;
            let uri = base.join(&segment.uri).map_err(|e| {
                IngestError::playlist(format!("invalid segment URI '{}': {e}", segment.uri))
            })?;

            // EXT-X-KEY applies to every following segment until replaced.
            if key_cleared(segment) {
                current_key = None;
            } else if let Some(key) = &segment.key {
                current_key = match &key.method {
                    KeyMethod::None => None,
                    KeyMethod::AES128 => {
                        let key_uri = key
                            .uri
                            .as_deref()
                            .ok_or_else(|| IngestError::playlist("AES-128 key without URI"))?;
                        Some(CipherInfo {
                            key_uri: base.join(key_uri).map_err(|e| {
                                IngestError::playlist(format!("invalid key URI '{key_uri}': {e}"))
                            })?,
                            iv: key.iv.clone(),
                        })
                    }
                    other => {
                        return Err(IngestError::decryption(format!(
                            "unsupported encryption method {other:?}"
                        )));
                    }
                };
            }

            if segment.discontinuity && idx > 0 {
                disc_seq = disc_seq.saturating_add(1);
            }

            let byte_range = match &segment.byte_range {
                Some(range) => {
                    let offset = range.offset.or_else(|| match &last_range {
                        Some((last_uri, end)) if *last_uri == uri => Some(*end),
                        _ => None,
                    });
                    let Some(offset) = offset else {
                        return Err(IngestError::playlist(format!(
                            "segment {seq} has a byte range without offset and no prior range"
                        )));
                    };
                    last_range = Some((uri.clone(), offset + range.length));
                    Some(ByteRange::new(offset, range.length))
                }
                None => {
                    last_range = None;
                    None
                }
            };

            let duration_us = (f64::from(segment.duration) * 1_000_000.0).round() as i64;
            items.push(SegmentItem {
                uri,
                seq,
                duration_us,
                start_us,
                discontinuity: segment.discontinuity,
                discontinuity_seq: disc_seq,
                cipher: current_key.clone(),
                byte_range,
            });
            start_us += duration_us;
        }

        Ok(PlaylistKind::Media {
            items,
            meta: PlaylistMeta {
                target_duration_us: media.target_duration as i64 * 1_000_000,
                media_sequence: media.media_sequence,
            },
            discontinuity_seq: base_disc,
            complete: media.end_list || media.playlist_type == Some(MediaPlaylistType::Vod),
            event: media.playlist_type == Some(MediaPlaylistType::Event),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_variant_playlist(&self) -> bool {
        matches!(self.kind, PlaylistKind::Master { .. })
    }

    /// Media playlist with `EXT-X-ENDLIST` (or VOD type): never refreshed.
    pub fn is_complete(&self) -> bool {
        matches!(self.kind, PlaylistKind::Media { complete: true, .. })
    }

    pub fn is_event(&self) -> bool {
        matches!(self.kind, PlaylistKind::Media { event: true, .. })
    }

    pub fn items(&self) -> &[SegmentItem] {
        match &self.kind {
            PlaylistKind::Media { items, .. } => items,
            PlaylistKind::Master { .. } => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn item_at(&self, index: usize) -> Option<&SegmentItem> {
        self.items().get(index)
    }

    pub fn meta(&self) -> Option<PlaylistMeta> {
        match &self.kind {
            PlaylistKind::Media { meta, .. } => Some(*meta),
            PlaylistKind::Master { .. } => None,
        }
    }

    pub fn target_duration(&self) -> Duration {
        self.meta()
            .map(|m| Duration::from_micros(m.target_duration_us.max(0) as u64))
            .unwrap_or_default()
    }

    /// `EXT-X-DISCONTINUITY-SEQUENCE` of the first item.
    pub fn discontinuity_seq(&self) -> u32 {
        match &self.kind {
            PlaylistKind::Media {
                discontinuity_seq, ..
            } => *discontinuity_seq,
            PlaylistKind::Master { .. } => 0,
        }
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.items().first().map(|item| item.seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.items().last().map(|item| item.seq)
    }

    pub fn item_for_seq(&self, seq: u64) -> Option<&SegmentItem> {
        let first = self.first_seq()?;
        let index = usize::try_from(seq.checked_sub(first)?).ok()?;
        self.item_at(index)
    }

    pub fn total_duration_us(&self) -> i64 {
        self.items().iter().map(|item| item.duration_us).sum()
    }

    /// Playlist-timeline start of segment `seq`.
    pub fn segment_start_time_us(&self, seq: u64) -> Option<i64> {
        self.item_for_seq(seq).map(|item| item.start_us)
    }

    pub fn variants(&self) -> Option<&VariantTable> {
        match &self.kind {
            PlaylistKind::Master { variants, .. } => Some(variants),
            PlaylistKind::Media { .. } => None,
        }
    }

    pub fn tracks(&self) -> Option<&TrackList> {
        match &self.kind {
            PlaylistKind::Master { tracks, .. } => Some(tracks),
            PlaylistKind::Media { .. } => None,
        }
    }

    pub fn tracks_mut(&mut self) -> Option<&mut TrackList> {
        match &mut self.kind {
            PlaylistKind::Master { tracks, .. } => Some(tracks),
            PlaylistKind::Media { .. } => None,
        }
    }
}

/// Result of fetching a playlist that may be unchanged since last time.
#[derive(Debug)]
pub enum PlaylistFetch {
    Unchanged,
    Updated { playlist: PlaylistSnapshot, raw: Bytes },
}

/// Fetch and parse a playlist, skipping the parse when the body is
/// byte-identical to `previous`.
pub async fn fetch_playlist(
    fetcher: &dyn ByteFetcher,
    url: &Url,
    previous: Option<&Bytes>,
    config: &PlaylistConfig,
    token: &CancellationToken,
) -> Result<PlaylistFetch> {
    let request = FetchRequest::new(url.clone()).with_timeout(config.fetch_timeout);
    let (raw, final_url) = fetch_all(fetcher, request, &config.retry, token).await?;

    if previous.is_some_and(|last| last.len() == raw.len() && *last == raw) {
        debug!(url = %url, "Playlist unchanged");
        return Ok(PlaylistFetch::Unchanged);
    }

    let playlist = PlaylistSnapshot::parse(&raw, &final_url)?;
    if playlist.is_empty() && !playlist.is_variant_playlist() {
        warn!(url = %url, "Media playlist has no segments");
    }
    Ok(PlaylistFetch::Updated { playlist, raw })
}

/// m3u8-rs rejects `METHOD=NONE` without an IV, leaving the tag among the
/// segment's unknown tags.
fn key_cleared(segment: &MediaSegment) -> bool {
    segment.unknown_tags.iter().any(|tag| {
        tag.tag == "X-KEY"
            && tag
                .rest
                .as_deref()
                .is_some_and(|rest| rest.split(',').any(|attr| attr.trim() == "METHOD=NONE"))
    })
}
