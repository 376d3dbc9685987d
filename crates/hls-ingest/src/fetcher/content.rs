//! Segment payload handling: TS demux, packed audio and WebVTT.

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{IngestError, Result};
use crate::id3;
use crate::queue::{AccessUnit, Dequeued, Discontinuity, DiscontinuityKind};
use crate::reassembler::ElementaryStreamQueue;
use crate::stream::{StreamMask, StreamType};
use crate::ts_demux::{TS_PACKET_SIZE, TS_SYNC_BYTE, TsDemux, TsDemuxer, find_sync};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const WEBVTT_MAGIC: &[u8] = b"WEBVTT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContainerKind {
    Ts,
    WebVtt,
    PackedAudio,
}

impl ContainerKind {
    pub fn sniff(data: &[u8]) -> Self {
        if data.first() == Some(&TS_SYNC_BYTE) {
            return Self::Ts;
        }
        let text = data.strip_prefix(UTF8_BOM).unwrap_or(data);
        if text.starts_with(WEBVTT_MAGIC) {
            return Self::WebVtt;
        }
        Self::PackedAudio
    }
}

/// Output of the parser, in queue order.
#[derive(Debug)]
pub(crate) enum Parsed {
    Unit(StreamType, AccessUnit),
    Discontinuity(StreamType, Discontinuity),
}

/// Turns segment bytes into access units. The container is sniffed from
/// the first bytes this parser ever sees and kept for its lifetime.
#[derive(Debug, Default)]
pub(crate) struct SegmentParser {
    kind: Option<ContainerKind>,
    demux: TsDemuxer,
    partial: BytesMut,
    whole: BytesMut,
    packed: Option<ElementaryStreamQueue>,
    /// Timestamp of the last tagged packed audio segment and its playlist
    /// start, used for segments that carry no tag.
    packed_base: Option<(i64, i64)>,
    output: Vec<Parsed>,
}

impl SegmentParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self) -> Option<ContainerKind> {
        self.kind
    }

    /// Stream types produced so far.
    pub fn stream_mask(&self) -> StreamMask {
        match self.kind {
            Some(ContainerKind::Ts) => self.demux.stream_mask(),
            Some(ContainerKind::WebVtt) => StreamMask::SUBTITLE,
            Some(ContainerKind::PackedAudio) => StreamMask::AUDIO,
            None => StreamMask::empty(),
        }
    }

    pub fn has_metadata(&self) -> bool {
        self.kind == Some(ContainerKind::Ts) && self.demux.has_source(StreamType::Metadata)
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let kind = *self.kind.get_or_insert_with(|| {
            let kind = ContainerKind::sniff(data);
            debug!(?kind, "Segment container");
            kind
        });
        match kind {
            ContainerKind::Ts => self.feed_ts(data),
            ContainerKind::WebVtt | ContainerKind::PackedAudio => {
                self.whole.extend_from_slice(data);
                Ok(())
            }
        }
    }

    fn feed_ts(&mut self, data: &[u8]) -> Result<()> {
        self.partial.extend_from_slice(data);
        let mut pos = 0;
        while self.partial.len() - pos >= TS_PACKET_SIZE {
            let packet = &self.partial[pos..pos + TS_PACKET_SIZE];
            match self.demux.feed_packet(packet) {
                Ok(()) => pos += TS_PACKET_SIZE,
                Err(IngestError::MalformedContent { .. }) if packet[0] != TS_SYNC_BYTE => {
                    match find_sync(&self.partial[pos + 1..]) {
                        Some(offset) => {
                            warn!(skipped = offset + 1, "Re-synchronising transport stream");
                            pos += offset + 1;
                        }
                        None => pos = self.partial.len(),
                    }
                }
                Err(err) => return Err(err),
            }
        }
        self.partial.advance(pos);
        self.collect_demuxed();
        Ok(())
    }

    fn collect_demuxed(&mut self) {
        for stream in self.demux.stream_mask().types() {
            let Some(source) = self.demux.source(stream) else {
                continue;
            };
            loop {
                match source.dequeue() {
                    Dequeued::Unit(unit) => self.output.push(Parsed::Unit(stream, unit)),
                    Dequeued::Discontinuity(d) => {
                        self.output.push(Parsed::Discontinuity(stream, d));
                    }
                    Dequeued::WouldBlock | Dequeued::EndOfStream | Dequeued::Error(_) => break,
                }
            }
        }
    }

    /// End of one segment. `segment_start_us` is its playlist start time.
    pub fn finish_segment(&mut self, segment_start_us: i64) -> Result<()> {
        match self.kind {
            None => Ok(()),
            Some(ContainerKind::Ts) => {
                if !self.partial.is_empty() {
                    warn!(bytes = self.partial.len(), "Dropping incomplete TS packet at segment end");
                    self.partial.clear();
                }
                Ok(())
            }
            Some(ContainerKind::WebVtt) => {
                let data = self.whole.split().freeze();
                trace!(size = data.len(), "WebVTT segment");
                self.output.push(Parsed::Unit(
                    StreamType::Subtitle,
                    AccessUnit::new(data, segment_start_us),
                ));
                Ok(())
            }
            Some(ContainerKind::PackedAudio) => self.finish_packed_audio(segment_start_us),
        }
    }

    fn finish_packed_audio(&mut self, segment_start_us: i64) -> Result<()> {
        let data = self.whole.split().freeze();
        let tag_len = id3::tag_len(&data).filter(|len| *len <= data.len());
        let pts = match tag_len {
            Some(len) => id3::transport_stream_timestamp(&data[..len])?,
            None => None,
        };
        let timestamp_us = match (pts, self.packed_base) {
            (Some(pts), _) => {
                let timestamp_us = pts as i64 * 100 / 9;
                self.packed_base = Some((timestamp_us, segment_start_us));
                timestamp_us
            }
            (None, Some((base_us, base_start_us))) => base_us + segment_start_us - base_start_us,
            (None, None) => {
                return Err(IngestError::unsupported_source(
                    "packed audio without a transport stream timestamp tag",
                ));
            }
        };

        let payload = &data[tag_len.unwrap_or(0)..];
        let queue = self.packed.get_or_insert_with(ElementaryStreamQueue::new);
        match queue.append(payload, timestamp_us) {
            Ok(()) => {}
            Err(IngestError::UnknownFormat) => {
                return Err(IngestError::unsupported_source(
                    "unrecognised packed audio payload",
                ));
            }
            Err(err) => return Err(err),
        }
        self.drain_packed()
    }

    fn drain_packed(&mut self) -> Result<()> {
        let Some(queue) = self.packed.as_mut() else {
            return Ok(());
        };
        while let Some(unit) = queue.dequeue_access_unit()? {
            self.output.push(Parsed::Unit(
                StreamType::Audio,
                AccessUnit {
                    is_sync: unit.is_sync,
                    format: queue.format(),
                    ..AccessUnit::new(unit.data, unit.timestamp_us)
                },
            ));
        }
        Ok(())
    }

    /// Drop partial state and emit a marker for every stream produced.
    pub fn signal_discontinuity(&mut self, kind: DiscontinuityKind, resume_at_us: Option<i64>) {
        self.partial.clear();
        self.whole.clear();
        match self.kind {
            Some(ContainerKind::Ts) => {
                self.demux.signal_discontinuity(kind, resume_at_us);
                self.collect_demuxed();
            }
            Some(ContainerKind::PackedAudio) | Some(ContainerKind::WebVtt) => {
                if let Some(queue) = self.packed.as_mut() {
                    queue.clear(kind == DiscontinuityKind::FormatChange);
                }
                if matches!(kind, DiscontinuityKind::TimeShift | DiscontinuityKind::FormatChange) {
                    self.packed_base = None;
                }
                let stream = if self.kind == Some(ContainerKind::WebVtt) {
                    StreamType::Subtitle
                } else {
                    StreamType::Audio
                };
                self.output.push(Parsed::Discontinuity(
                    stream,
                    Discontinuity {
                        resume_at_us,
                        ..Discontinuity::new(kind)
                    },
                ));
            }
            None => {}
        }
    }

    /// Flush everything still buffered at the end of the playlist.
    pub fn signal_eos(&mut self) -> Result<()> {
        match self.kind {
            Some(ContainerKind::Ts) => {
                let flushed = self.demux.signal_eos(IngestError::EndOfStream);
                self.collect_demuxed();
                flushed
            }
            Some(ContainerKind::PackedAudio) => {
                if let Some(queue) = self.packed.as_mut() {
                    queue.signal_eos();
                }
                self.drain_packed()
            }
            Some(ContainerKind::WebVtt) | None => Ok(()),
        }
    }

    pub fn take_output(&mut self) -> Vec<Parsed> {
        std::mem::take(&mut self.output)
    }
}
