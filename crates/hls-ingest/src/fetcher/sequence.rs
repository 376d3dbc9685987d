//! Media sequence number resolution.

use crate::playlist::PlaylistSnapshot;

use super::messages::StartPosition;

/// Where fetching begins within a playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedStart {
    pub seq: u64,
    /// Offset into the segment below which units are dropped.
    pub offset_us: Option<i64>,
}

/// Sequence number of the segment covering playlist time `time_us`.
/// Times past the end map to the last segment.
pub(crate) fn seq_for_time(playlist: &PlaylistSnapshot, time_us: i64) -> Option<u64> {
    let items = playlist.items();
    let last = items.last()?;
    Some(
        items
            .iter()
            .find(|item| time_us < item.start_us + item.duration_us)
            .unwrap_or(last)
            .seq,
    )
}

/// First segment that belongs to discontinuity sequence `disc_seq` or a
/// later one.
pub(crate) fn seq_for_discontinuity(playlist: &PlaylistSnapshot, disc_seq: u32) -> Option<u64> {
    playlist
        .items()
        .iter()
        .find(|item| item.discontinuity_seq >= disc_seq)
        .map(|item| item.seq)
}

/// Live-edge start: `offset` segments before the end, clamped to the window.
pub(crate) fn live_edge_seq(playlist: &PlaylistSnapshot, offset: u64) -> Option<u64> {
    let first = playlist.first_seq()?;
    let last = playlist.last_seq()?;
    Some(last.saturating_sub(offset).max(first))
}

/// Pick the first sequence number for a (re)started fetcher.
pub(crate) fn resolve_start(
    playlist: &PlaylistSnapshot,
    position: &StartPosition,
    live_start_offset: u64,
) -> Option<ResolvedStart> {
    let first = playlist.first_seq()?;
    let last = playlist.last_seq()?;
    let seekable = playlist.is_complete() || playlist.is_event();

    let Some(segment_start_us) = position.segment_start_time_us else {
        if !seekable {
            return Some(ResolvedStart {
                seq: live_edge_seq(playlist, live_start_offset)?,
                offset_us: None,
            });
        }
        let time_us = position.start_time_us.unwrap_or(0).max(0);
        let seq = seq_for_time(playlist, time_us)?;
        let segment_start = playlist.segment_start_time_us(seq).unwrap_or(0);
        return Some(ResolvedStart {
            seq,
            offset_us: Some(time_us - segment_start).filter(|offset| *offset > 0),
        });
    };

    let mut seq = seq_for_time(playlist, segment_start_us)?;
    if position.adaptive {
        // The previous producer already covers this segment.
        seq += 1;
    }
    if let Some(min_seq) = position
        .discontinuity_seq
        .and_then(|disc| seq_for_discontinuity(playlist, disc))
    {
        seq = seq.max(min_seq);
    }
    Some(ResolvedStart {
        seq: seq.clamp(first, last),
        offset_us: position.start_time_us.filter(|t| *t > 0),
    })
}

/// Where a sequence number stands relative to the playlist window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqStatus {
    Available,
    /// Not published yet; wait for a refresh.
    Ahead,
    /// Complete playlist exhausted.
    Finished,
    /// Rolled out of the live window; resume at the given sequence.
    MissedTheBoat { resume_at: u64 },
}

pub(crate) fn check_seq(playlist: &PlaylistSnapshot, seq: u64, live_start_offset: u64) -> SeqStatus {
    let (Some(first), Some(last)) = (playlist.first_seq(), playlist.last_seq()) else {
        return if playlist.is_complete() {
            SeqStatus::Finished
        } else {
            SeqStatus::Ahead
        };
    };
    if seq > last {
        return if playlist.is_complete() {
            SeqStatus::Finished
        } else {
            SeqStatus::Ahead
        };
    }
    if seq < first {
        return SeqStatus::MissedTheBoat {
            resume_at: last.saturating_sub(live_start_offset).max(first),
        };
    }
    SeqStatus::Available
}
