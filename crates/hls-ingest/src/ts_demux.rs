//! Minimal MPEG-2 transport stream demultiplexer.
//!
//! Parses PAT, PMT and PES just far enough to route each elementary stream
//! through an [`ElementaryStreamQueue`] and collect the resulting access
//! units in one [`PacketQueue`] per stream type. PSI sections that span
//! several packets are not reassembled.

use std::collections::HashMap;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::error::{IngestError, Result};
use crate::queue::{AccessUnit, Discontinuity, DiscontinuityKind, PacketQueue};
use crate::reassembler::{ElementaryStreamQueue, EsMode};
use crate::stream::{StreamMask, StreamType};

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

const PID_PAT: u16 = 0x0000;
const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;
const PTS_MASK: i64 = (1 << 33) - 1;

/// Demultiplexer surface the segment fetcher drives.
pub trait TsDemux: Send {
    /// Feed exactly one 188 byte packet.
    fn feed_packet(&mut self, packet: &[u8]) -> Result<()>;

    fn has_source(&self, stream: StreamType) -> bool;

    /// Queue collecting the access units of `stream`.
    fn source(&self, stream: StreamType) -> Option<&PacketQueue>;

    /// Drop partial state and queue a marker on every source.
    fn signal_discontinuity(&mut self, kind: DiscontinuityKind, resume_at_us: Option<i64>);

    /// Flush pending PES data and mark every source final.
    fn signal_eos(&mut self, result: IngestError) -> Result<()>;
}

/// Reassembler mode for a PMT stream type. Private data streams are
/// identified through their registration descriptors.
pub fn mode_for_stream_type(stream_type: u8, descriptors: &[u8]) -> Option<EsMode> {
    match stream_type {
        0x01 | 0x02 => Some(EsMode::Mpeg2Video),
        0x03 | 0x04 => Some(EsMode::MpegAudio),
        0x0F => Some(EsMode::Aac),
        0x10 => Some(EsMode::Mpeg4Video),
        0x15 => Some(EsMode::Metadata),
        0x1B => Some(EsMode::H264),
        0x24 => Some(EsMode::H265),
        0x81 | 0x87 => Some(EsMode::Ddp),
        0x82 | 0x86 => Some(EsMode::Dts),
        0x83 => Some(EsMode::Pcm),
        0x06 => descriptor_tags(descriptors).find_map(|tag| match tag {
            0x6A | 0x7A => Some(EsMode::Ddp),
            0x7B => Some(EsMode::Dts),
            _ => None,
        }),
        _ => None,
    }
}

fn descriptor_tags(mut data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    std::iter::from_fn(move || {
        let (&tag, rest) = data.split_first()?;
        let (&len, rest) = rest.split_first()?;
        data = rest.get(usize::from(len)..).unwrap_or_default();
        Some(tag)
    })
}

fn stream_type_for(mode: EsMode) -> StreamType {
    if mode.is_video() {
        StreamType::Video
    } else if mode.is_audio() {
        StreamType::Audio
    } else {
        StreamType::Metadata
    }
}

/// Extends 33-bit PTS values across wraps.
#[derive(Debug, Default)]
struct PtsClock {
    last: Option<i64>,
}

impl PtsClock {
    fn recover_us(&mut self, pts: u64) -> i64 {
        let pts = (pts as i64) & PTS_MASK;
        let recovered = match self.last {
            None => pts,
            Some(last) => pts + ((last - pts + (1 << 32)) & !PTS_MASK),
        };
        self.last = Some(recovered);
        recovered * 100 / 9
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Debug)]
struct PesHeader {
    pts: Option<u64>,
    payload_offset: usize,
}

fn parse_timestamp(data: &[u8]) -> u64 {
    ((u64::from(data[0]) >> 1) & 0x07) << 30
        | u64::from(data[1]) << 22
        | ((u64::from(data[2]) >> 1) & 0x7F) << 15
        | u64::from(data[3]) << 7
        | ((u64::from(data[4]) >> 1) & 0x7F)
}

impl PesHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 9 || data[..3] != [0x00, 0x00, 0x01] {
            return Err(IngestError::malformed("PES packet without start code"));
        }
        let pts_dts_flags = data[7] >> 6;
        let payload_offset = 9 + usize::from(data[8]);
        if data.len() < payload_offset {
            return Err(IngestError::malformed("truncated PES header"));
        }
        let pts = if pts_dts_flags & 0b10 != 0 && payload_offset >= 14 {
            Some(parse_timestamp(&data[9..14]))
        } else {
            None
        };
        Ok(Self {
            pts,
            payload_offset,
        })
    }
}

#[derive(Debug)]
struct PesStream {
    stream: StreamType,
    queue: ElementaryStreamQueue,
    buffer: BytesMut,
    started: bool,
    expected_len: Option<usize>,
    last_timestamp_us: i64,
}

impl PesStream {
    fn new(mode: EsMode) -> Self {
        Self {
            stream: stream_type_for(mode),
            queue: ElementaryStreamQueue::with_mode(mode),
            buffer: BytesMut::new(),
            started: false,
            expected_len: None,
            last_timestamp_us: 0,
        }
    }

    fn reset(&mut self, clear_format: bool) {
        self.buffer.clear();
        self.started = false;
        self.expected_len = None;
        self.queue.clear(clear_format);
    }

    fn flush(&mut self, clock: &mut PtsClock, source: &PacketQueue) -> Result<()> {
        self.started = false;
        self.expected_len = None;
        let pes = self.buffer.split().freeze();
        if pes.is_empty() {
            return Ok(());
        }
        let header = PesHeader::parse(&pes)?;
        let timestamp_us = match header.pts {
            Some(pts) => clock.recover_us(pts),
            None => self.last_timestamp_us,
        };
        self.last_timestamp_us = timestamp_us;

        let payload = pes.slice(header.payload_offset..);
        if !payload.is_empty() {
            match self.queue.append(&payload, timestamp_us) {
                Ok(()) => {}
                Err(IngestError::UnknownFormat) => {
                    trace!(stream = %self.stream, "Elementary stream not identified yet");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        self.drain(source)
    }

    fn drain(&mut self, source: &PacketQueue) -> Result<()> {
        while let Some(unit) = self.queue.dequeue_access_unit()? {
            trace!(
                stream = %self.stream,
                ts = unit.timestamp_us,
                size = unit.data.len(),
                "Demuxed access unit"
            );
            source.queue_access_unit(AccessUnit {
                is_sync: unit.is_sync,
                sei: unit.sei,
                format: self.queue.format(),
                ..AccessUnit::new(unit.data, unit.timestamp_us)
            });
        }
        Ok(())
    }
}

/// Single-program transport stream demultiplexer.
#[derive(Debug, Default)]
pub struct TsDemuxer {
    pmt_pid: Option<u16>,
    streams: HashMap<u16, PesStream>,
    sources: HashMap<StreamType, PacketQueue>,
    clock: PtsClock,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream types announced by the PMT so far.
    pub fn stream_mask(&self) -> StreamMask {
        self.sources.keys().copied().collect()
    }

    fn parse_pat(&mut self, section: &[u8]) -> Result<()> {
        let section = psi_section(section, TABLE_ID_PAT)?;
        let pmt_pid = section
            .get(8..)
            .unwrap_or_default()
            .chunks_exact(4)
            .find(|entry| u16::from_be_bytes([entry[0], entry[1]]) != 0)
            .map(|entry| u16::from(entry[2] & 0x1F) << 8 | u16::from(entry[3]));
        if pmt_pid.is_some() && pmt_pid != self.pmt_pid {
            debug!(pmt_pid = ?pmt_pid, "Program map PID");
            self.pmt_pid = pmt_pid;
            self.streams.clear();
        }
        Ok(())
    }

    fn parse_pmt(&mut self, section: &[u8]) -> Result<()> {
        let section = psi_section(section, TABLE_ID_PMT)?;
        if section.len() < 12 {
            return Err(IngestError::malformed("truncated PMT"));
        }
        let program_info_len = usize::from(u16::from_be_bytes([section[10], section[11]]) & 0x0FFF);
        let mut pos = 12 + program_info_len;
        while pos + 5 <= section.len() {
            let stream_type = section[pos];
            let pid = u16::from(section[pos + 1] & 0x1F) << 8 | u16::from(section[pos + 2]);
            let info_len = usize::from(u16::from_be_bytes([section[pos + 3], section[pos + 4]]) & 0x0FFF);
            let descriptors = section
                .get(pos + 5..pos + 5 + info_len)
                .unwrap_or_default();
            pos += 5 + info_len;

            if self.streams.contains_key(&pid) {
                continue;
            }
            let Some(mode) = mode_for_stream_type(stream_type, descriptors) else {
                debug!(pid, stream_type, "Ignoring unsupported elementary stream");
                continue;
            };
            let stream = stream_type_for(mode);
            if self.streams.values().any(|s| s.stream == stream) {
                debug!(pid, %stream, "Ignoring additional elementary stream");
                continue;
            }
            debug!(pid, stream_type, %mode, %stream, "Elementary stream");
            self.streams.insert(pid, PesStream::new(mode));
            self.sources
                .entry(stream)
                .or_insert_with(|| PacketQueue::new(stream));
        }
        Ok(())
    }

    fn feed_pes(&mut self, pid: u16, start: bool, payload: &[u8]) -> Result<()> {
        let Self {
            streams,
            sources,
            clock,
            ..
        } = self;
        let Some(stream) = streams.get_mut(&pid) else {
            return Ok(());
        };
        let Some(source) = sources.get(&stream.stream) else {
            return Ok(());
        };

        if start {
            if stream.started {
                stream.flush(clock, source)?;
            }
            stream.started = true;
            stream.expected_len = payload
                .get(4..6)
                .map(|len| usize::from(u16::from_be_bytes([len[0], len[1]])))
                .filter(|len| *len != 0)
                .map(|len| len + 6);
        } else if !stream.started {
            return Ok(());
        }
        stream.buffer.extend_from_slice(payload);

        if stream.expected_len.is_some_and(|len| stream.buffer.len() >= len) {
            stream.flush(clock, source)?;
        }
        Ok(())
    }
}

/// Body of a PSI section that starts in this packet, CRC excluded.
fn psi_section(payload: &[u8], table_id: u8) -> Result<&[u8]> {
    let pointer = usize::from(*payload.first().unwrap_or(&0));
    let section = payload
        .get(1 + pointer..)
        .filter(|s| s.len() >= 3)
        .ok_or_else(|| IngestError::malformed("truncated PSI section"))?;
    if section[0] != table_id {
        return Err(IngestError::malformed(format!(
            "unexpected table id {:#04x}",
            section[0]
        )));
    }
    let section_len = usize::from(u16::from_be_bytes([section[1], section[2]]) & 0x0FFF);
    let end = (3 + section_len).saturating_sub(4).min(section.len());
    Ok(&section[..end])
}

impl TsDemux for TsDemuxer {
    fn feed_packet(&mut self, packet: &[u8]) -> Result<()> {
        if packet.len() != TS_PACKET_SIZE {
            return Err(IngestError::malformed(format!(
                "TS packet of {} bytes",
                packet.len()
            )));
        }
        if packet[0] != TS_SYNC_BYTE {
            return Err(IngestError::malformed(format!(
                "TS sync byte {:#04x}",
                packet[0]
            )));
        }
        if packet[1] & 0x80 != 0 {
            warn!("Dropping TS packet with transport error indicator");
            return Ok(());
        }
        let start = packet[1] & 0x40 != 0;
        let pid = u16::from(packet[1] & 0x1F) << 8 | u16::from(packet[2]);
        let adaptation_field_control = (packet[3] >> 4) & 0x03;

        let mut offset = 4;
        if adaptation_field_control & 0b10 != 0 {
            offset += 1 + usize::from(packet[4]);
            if offset > TS_PACKET_SIZE {
                return Err(IngestError::malformed("adaptation field overruns packet"));
            }
        }
        if adaptation_field_control & 0b01 == 0 || offset == TS_PACKET_SIZE {
            return Ok(());
        }
        let payload = &packet[offset..];

        if pid == PID_PAT {
            if start {
                self.parse_pat(payload)?;
            }
        } else if Some(pid) == self.pmt_pid {
            if start {
                self.parse_pmt(payload)?;
            }
        } else {
            self.feed_pes(pid, start, payload)?;
        }
        Ok(())
    }

    fn has_source(&self, stream: StreamType) -> bool {
        self.sources.contains_key(&stream)
    }

    fn source(&self, stream: StreamType) -> Option<&PacketQueue> {
        self.sources.get(&stream)
    }

    fn signal_discontinuity(&mut self, kind: DiscontinuityKind, resume_at_us: Option<i64>) {
        let format_change = kind == DiscontinuityKind::FormatChange;
        for stream in self.streams.values_mut() {
            stream.reset(format_change);
        }
        if matches!(
            kind,
            DiscontinuityKind::TimeShift | DiscontinuityKind::FormatChange
        ) {
            self.clock.reset();
        }
        if format_change {
            // The next variant may use different PIDs.
            self.pmt_pid = None;
            self.streams.clear();
        }
        for source in self.sources.values() {
            source.queue_discontinuity(
                Discontinuity {
                    resume_at_us,
                    ..Discontinuity::new(kind)
                },
                false,
            );
        }
    }

    fn signal_eos(&mut self, result: IngestError) -> Result<()> {
        let Self {
            streams,
            sources,
            clock,
            ..
        } = self;
        let mut first_err = None;
        for stream in streams.values_mut() {
            let Some(source) = sources.get(&stream.stream) else {
                continue;
            };
            let flushed = if stream.started {
                stream.flush(clock, source)
            } else {
                Ok(())
            };
            stream.queue.signal_eos();
            if let Err(err) = flushed.and_then(|()| stream.drain(source)) {
                first_err.get_or_insert(err);
            }
        }
        for source in sources.values() {
            source.signal_eos(result.clone());
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Offset of the first position where two consecutive sync bytes line up,
/// used to re-synchronise after a corrupt packet.
pub fn find_sync(data: &[u8]) -> Option<usize> {
    (0..data.len()).find(|&i| {
        data[i] == TS_SYNC_BYTE
            && data
                .get(i + TS_PACKET_SIZE)
                .is_none_or(|&b| b == TS_SYNC_BYTE)
    })
}
