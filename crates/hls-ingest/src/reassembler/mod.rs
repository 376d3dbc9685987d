//! Elementary stream reassembler.
//!
//! Turns an appended byte stream of one elementary stream into discrete,
//! timestamped access units. The container mode is either given up front
//! (from the PMT stream type) or sniffed from the first bytes.

mod adts;
mod ddp;
mod dts;
mod h264;
mod hevc;
mod mpeg_audio;
mod mpeg_video;
mod passthrough;
mod range;

pub use range::RangeQueue;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{IngestError, Result};
use crate::format::MediaFormat;
use crate::id3;
use mpeg_video::MpegVideoKind;

/// Upper bound for bytes held while the format is still unknown.
const MAX_SNIFF_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EsMode {
    H264,
    H265,
    Aac,
    MpegAudio,
    Dts,
    Ddp,
    Mpeg2Video,
    Mpeg4Video,
    Pcm,
    Metadata,
}

impl EsMode {
    pub fn is_video(self) -> bool {
        matches!(
            self,
            Self::H264 | Self::H265 | Self::Mpeg2Video | Self::Mpeg4Video
        )
    }

    pub fn is_audio(self) -> bool {
        matches!(
            self,
            Self::Aac | Self::MpegAudio | Self::Dts | Self::Ddp | Self::Pcm
        )
    }
}

impl fmt::Display for EsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Aac => "aac",
            Self::MpegAudio => "mpeg-audio",
            Self::Dts => "dts",
            Self::Ddp => "ddp",
            Self::Mpeg2Video => "mpeg2-video",
            Self::Mpeg4Video => "mpeg4-video",
            Self::Pcm => "pcm",
            Self::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// Access unit cut by the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsUnit {
    pub data: Bytes,
    pub timestamp_us: i64,
    pub is_sync: bool,
    /// Byte ranges of SEI NAL units inside `data`.
    pub sei: Vec<Range<usize>>,
}

/// One unit found by a format scanner.
#[derive(Debug)]
pub(crate) struct Framed {
    pub data: Bytes,
    /// Input bytes the unit occupied.
    pub consumed: usize,
    pub is_sync: bool,
    pub sei: Vec<Range<usize>>,
    /// Set when the scanner was asked for a format and could derive one.
    pub format: Option<MediaFormat>,
    /// Fixed duration of the unit, used to space out several units cut
    /// from the same append.
    pub duration_us: Option<i64>,
}

#[derive(Debug)]
pub(crate) enum Scan {
    NeedMore,
    /// Drop bytes that cannot start a unit.
    Skip(usize),
    /// Drop a structurally invalid unit and report it.
    Invalid(usize, IngestError),
    Unit(Framed),
}

/// Find the container of an unknown stream.
///
/// Returns the mode and the offset of its first sync pattern. A leading ID3
/// tag is skipped over; an incomplete one defers the decision.
pub fn sniff(data: &[u8]) -> Option<(EsMode, usize)> {
    let mut start = 0;
    if let Some(len) = id3::tag_len(data) {
        if data.len() < len {
            return None;
        }
        start = len;
    }
    if data.get(start) == Some(&passthrough::PCM_HEADER_MARKER)
        && data.len() >= start + 4
        && data[start + 3] == 0b0001_0001
    {
        return Some((EsMode::Pcm, start));
    }

    (start..data.len()).find_map(|pos| {
        let mode = sniff_at(&data[pos..])?;
        // Include the leading zero of a four byte start code.
        let pos = if mode.is_video() && pos > start && data[pos - 1] == 0 {
            pos - 1
        } else {
            pos
        };
        Some((mode, pos))
    })
}

fn sniff_at(data: &[u8]) -> Option<EsMode> {
    if data.len() >= 4 && data[..3] == [0x00, 0x00, 0x01] {
        return sniff_start_code(data[3], data.get(4).copied());
    }
    if dts::is_sync(data) {
        return Some(EsMode::Dts);
    }
    if adts::AdtsHeader::parse(data).is_some() {
        return Some(EsMode::Aac);
    }
    if ddp::DdpHeader::parse(data).is_some() {
        return Some(EsMode::Ddp);
    }
    if mpeg_audio::MpegAudioHeader::parse(data).is_some() {
        return Some(EsMode::MpegAudio);
    }
    None
}

fn sniff_start_code(b0: u8, b1: Option<u8>) -> Option<EsMode> {
    let b1 = b1?;
    // HEVC parameter sets and delimiters (layer 0, temporal id 1).
    if matches!(b0, 0x40 | 0x42 | 0x44 | 0x46 | 0x4E) && b1 == 0x01 {
        return Some(EsMode::H265);
    }
    match b0 {
        0xB3 => return Some(EsMode::Mpeg2Video),
        0xB0 | 0xB5 | 0x20..=0x2F => return Some(EsMode::Mpeg4Video),
        _ => {}
    }
    if b0 & 0x80 == 0 && (1..=12).contains(&(b0 & 0x1F)) {
        return Some(EsMode::H264);
    }
    let hevc_type = b0 >> 1;
    if b0 & 0x81 == 0 && b1 == 0x01 && (hevc_type <= 21 || (32..=40).contains(&hevc_type)) {
        return Some(EsMode::H265);
    }
    None
}

/// Stateful per-track reassembly buffer.
#[derive(Debug)]
pub struct ElementaryStreamQueue {
    mode: Option<EsMode>,
    buffer: BytesMut,
    ranges: RangeQueue,
    format: Option<Arc<MediaFormat>>,
    eos: bool,
}

impl Default for ElementaryStreamQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementaryStreamQueue {
    /// Queue that sniffs its container from the first bytes.
    pub fn new() -> Self {
        Self {
            mode: None,
            buffer: BytesMut::new(),
            ranges: RangeQueue::new(),
            format: None,
            eos: false,
        }
    }

    pub fn with_mode(mode: EsMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::new()
        }
    }

    pub fn mode(&self) -> Option<EsMode> {
        self.mode
    }

    pub fn format(&self) -> Option<Arc<MediaFormat>> {
        self.format.clone()
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// Bytes waiting to be cut into units.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append bytes that were stamped with `timestamp_us`.
    ///
    /// Fails with [`IngestError::UnknownFormat`] while the container cannot
    /// be identified; the bytes are kept and sniffing is retried with the
    /// next append.
    pub fn append(&mut self, data: &[u8], timestamp_us: i64) -> Result<()> {
        if self.eos {
            return Err(IngestError::invalid_operation(
                "append after end of stream",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }

        let Some(mode) = self.mode else {
            self.buffer.extend_from_slice(data);
            self.ranges.push(data.len(), timestamp_us);
            return self.try_sniff();
        };

        if self.buffer.is_empty() {
            // Realign to the first sync pattern of a fresh run.
            if let Some(offset) = first_sync(mode, data) {
                if offset > 0 {
                    debug!(mode = %mode, skipped = offset, "Discarding bytes before sync");
                }
                let data = &data[offset..];
                self.buffer.extend_from_slice(data);
                self.ranges.push(data.len(), timestamp_us);
                return Ok(());
            }
            if let Some(offset) = partial_sync(mode, data) {
                // The pattern may continue in the next append.
                let data = &data[offset..];
                self.buffer.extend_from_slice(data);
                self.ranges.push(data.len(), timestamp_us);
                return Ok(());
            }
            return Err(IngestError::malformed(format!(
                "no {mode} sync pattern in {} appended bytes",
                data.len()
            )));
        }

        self.buffer.extend_from_slice(data);
        self.ranges.push(data.len(), timestamp_us);
        Ok(())
    }

    fn try_sniff(&mut self) -> Result<()> {
        match sniff(&self.buffer) {
            Some((mode, offset)) => {
                debug!(mode = %mode, offset, "Detected elementary stream format");
                self.mode = Some(mode);
                self.discard(offset);
                Ok(())
            }
            None => {
                if self.buffer.len() > MAX_SNIFF_BUFFER {
                    let excess = self.buffer.len() - MAX_SNIFF_BUFFER;
                    self.discard(excess);
                }
                Err(IngestError::UnknownFormat)
            }
        }
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        if n == 0 {
            return;
        }
        self.buffer.advance(n);
        self.ranges.fetch_timestamp(n);
    }

    /// Cut the next access unit. `Ok(None)` means more input is needed.
    pub fn dequeue_access_unit(&mut self) -> Result<Option<EsUnit>> {
        let Some(mode) = self.mode else {
            return Ok(None);
        };
        loop {
            let need_format = self.format.is_none();
            let scan = match mode {
                EsMode::H264 => h264::scan(&self.buffer, self.eos, need_format)?,
                EsMode::H265 => hevc::scan(&self.buffer, self.eos, need_format)?,
                EsMode::Aac => adts::scan(&self.buffer, need_format)?,
                EsMode::MpegAudio => mpeg_audio::scan(&self.buffer, need_format)?,
                EsMode::Ddp => ddp::scan(&self.buffer, need_format)?,
                EsMode::Dts => dts::scan(&self.buffer, self.eos, need_format)?,
                EsMode::Mpeg2Video => {
                    mpeg_video::scan(MpegVideoKind::Mpeg2, &self.buffer, self.eos, need_format)?
                }
                EsMode::Mpeg4Video => {
                    mpeg_video::scan(MpegVideoKind::Mpeg4, &self.buffer, self.eos, need_format)?
                }
                EsMode::Pcm => passthrough::scan_pcm(&self.buffer, need_format)?,
                EsMode::Metadata => passthrough::scan_metadata(
                    &self.buffer,
                    self.ranges.front_len(),
                    need_format,
                ),
            };

            match scan {
                Scan::NeedMore => return Ok(None),
                Scan::Skip(n) => {
                    if n == 0 {
                        return Ok(None);
                    }
                    trace!(mode = %mode, skipped = n, "Skipping unframed bytes");
                    self.discard(n);
                }
                Scan::Invalid(n, err) => {
                    self.discard(n.max(1));
                    return Err(err);
                }
                Scan::Unit(framed) => return self.finish_unit(framed).map(Some),
            }
        }
    }

    fn finish_unit(&mut self, framed: Framed) -> Result<EsUnit> {
        let record = self.ranges.fetch_timestamp_indexed(framed.consumed);
        self.buffer.advance(framed.consumed.min(self.buffer.len()));
        let Some((base, index)) = record else {
            warn!(size = framed.consumed, "Access unit without a timestamp record");
            return Err(IngestError::malformed(
                "access unit bytes carry no timestamp",
            ));
        };
        let timestamp_us = match framed.duration_us {
            Some(duration) => base + i64::from(index) * duration,
            None => base,
        };
        if let Some(format) = framed.format {
            debug!(mime = format.mime, "Elementary stream format available");
            self.format = Some(Arc::new(format));
        }
        Ok(EsUnit {
            data: framed.data,
            timestamp_us,
            is_sync: framed.is_sync,
            sei: framed.sei,
        })
    }

    /// No more input will arrive. Formats that need a terminator to cut
    /// their last unit get one.
    pub fn signal_eos(&mut self) {
        if self.eos {
            return;
        }
        let marker = match self.mode {
            Some(EsMode::Mpeg2Video) => Some(MpegVideoKind::Mpeg2.end_marker()),
            Some(EsMode::Mpeg4Video) => Some(MpegVideoKind::Mpeg4.end_marker()),
            _ => None,
        };
        if let Some(marker) = marker
            && !self.buffer.is_empty()
        {
            self.buffer.extend_from_slice(&marker);
        }
        self.eos = true;
    }

    /// Drop buffered bytes and re-arm after end of stream. With
    /// `clear_format`, the derived format is forgotten too.
    pub fn clear(&mut self, clear_format: bool) {
        self.buffer.clear();
        self.ranges.clear();
        self.eos = false;
        if clear_format {
            self.format = None;
        }
    }
}

/// Offset of the first position where `mode` could start a unit.
fn first_sync(mode: EsMode, data: &[u8]) -> Option<usize> {
    match mode {
        EsMode::H264 | EsMode::H265 | EsMode::Mpeg2Video | EsMode::Mpeg4Video => {
            h265::next_start_code(data, 0).map(|(pos, _)| pos)
        }
        EsMode::Aac => (0..data.len().saturating_sub(1)).find(|&i| adts::is_sync(&data[i..])),
        EsMode::Ddp => (0..data.len().saturating_sub(1)).find(|&i| ddp::is_sync(&data[i..])),
        EsMode::Dts => (0..data.len()).find(|&i| dts::is_sync(&data[i..])),
        EsMode::MpegAudio => (0..data.len().saturating_sub(1))
            .find(|&i| data[i] == 0xFF && data[i + 1] & 0xE0 == 0xE0),
        EsMode::Pcm | EsMode::Metadata => Some(0),
    }
}

/// Start of a trailing run of `data` that could be the head of a sync
/// pattern cut by the append boundary.
fn partial_sync(mode: EsMode, data: &[u8]) -> Option<usize> {
    const DTS_SYNC: [[u8; 4]; 5] = [
        [0x7F, 0xFE, 0x80, 0x01],
        [0xFE, 0x7F, 0x01, 0x80],
        [0x1F, 0xFF, 0xE8, 0x00],
        [0xFF, 0x1F, 0x00, 0xE8],
        [0x64, 0x58, 0x20, 0x25],
    ];
    let last = data.len().checked_sub(1)?;
    match mode {
        EsMode::H264 | EsMode::H265 | EsMode::Mpeg2Video | EsMode::Mpeg4Video => {
            let zeros = data.iter().rev().take(3).take_while(|b| **b == 0).count();
            (zeros > 0).then(|| data.len() - zeros)
        }
        EsMode::Aac | EsMode::MpegAudio => (data[last] == 0xFF).then_some(last),
        EsMode::Ddp => (data[last] == 0x0B).then_some(last),
        EsMode::Dts => (data.len().saturating_sub(3)..data.len()).find(|&i| {
            let tail = &data[i..];
            DTS_SYNC.iter().any(|sync| sync.starts_with(tail))
        }),
        EsMode::Pcm | EsMode::Metadata => Some(0),
    }
}
