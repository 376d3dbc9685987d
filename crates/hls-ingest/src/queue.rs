//! Packet queue: the ordered hand-off point between fetchers and the
//! consumer.
//!
//! One queue carries access units and in-band discontinuity markers for a
//! single stream type. Producers and the consumer may run on different
//! threads; all state sits behind one mutex, so every operation is atomic
//! with respect to the others.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::IngestError;
use crate::format::MediaFormat;
use crate::stream::StreamType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscontinuityKind {
    None,
    /// Timestamps restart; decoder state may be kept.
    TimeShift,
    /// Format changed; the consumer must flush its decoder.
    FormatChange,
    /// Data was skipped (missed segments, reset stream).
    DataCorruption,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discontinuity {
    pub kind: DiscontinuityKind,
    /// Marks the first entry written by a fetcher that replaces another one
    /// during a bandwidth switch.
    pub swap: bool,
    /// Switch generation that produced a swap marker.
    pub switch_generation: u64,
    /// Presentation time the stream resumes at, when known.
    pub resume_at_us: Option<i64>,
}

impl Discontinuity {
    pub fn new(kind: DiscontinuityKind) -> Self {
        Self {
            kind,
            swap: false,
            switch_generation: 0,
            resume_at_us: None,
        }
    }

    pub fn swap(switch_generation: u64) -> Self {
        Self {
            kind: DiscontinuityKind::FormatChange,
            swap: true,
            switch_generation,
            resume_at_us: None,
        }
    }
}

/// One decodable unit of a single elementary stream.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub timestamp_us: i64,
    pub is_sync: bool,
    /// Discontinuity sequence of the segment this unit came from.
    pub discontinuity_seq: u32,
    /// Target duration of the playlist that produced this unit.
    pub target_duration_us: i64,
    /// Media sequence number of the source segment.
    pub segment_seq: u64,
    /// Playlist-timeline start of the source segment.
    pub segment_start_us: i64,
    pub format: Option<Arc<MediaFormat>>,
    /// Byte ranges of SEI NAL units inside `data`.
    pub sei: Vec<Range<usize>>,
}

impl AccessUnit {
    pub fn new(data: Bytes, timestamp_us: i64) -> Self {
        Self {
            data,
            timestamp_us,
            is_sync: true,
            discontinuity_seq: 0,
            target_duration_us: 0,
            segment_seq: 0,
            segment_start_us: 0,
            format: None,
            sei: Vec::new(),
        }
    }

    pub fn meta(&self) -> UnitMeta {
        UnitMeta {
            timestamp_us: self.timestamp_us,
            discontinuity_seq: self.discontinuity_seq,
            segment_seq: self.segment_seq,
            segment_start_us: self.segment_start_us,
            target_duration_us: self.target_duration_us,
        }
    }
}

/// Position metadata of an enqueued or dequeued unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitMeta {
    pub timestamp_us: i64,
    pub discontinuity_seq: u32,
    pub segment_seq: u64,
    pub segment_start_us: i64,
    pub target_duration_us: i64,
}

#[derive(Debug, Clone)]
enum Entry {
    Unit(AccessUnit),
    Discontinuity(Discontinuity),
}

/// Outcome of a dequeue attempt.
#[derive(Debug, Clone)]
pub enum Dequeued {
    Unit(AccessUnit),
    Discontinuity(Discontinuity),
    /// Nothing queued yet, more may arrive.
    WouldBlock,
    EndOfStream,
    Error(IngestError),
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    final_result: Option<IngestError>,
    format: Option<Arc<MediaFormat>>,
    latest_enqueued: Option<UnitMeta>,
    latest_dequeued: Option<UnitMeta>,
}

#[derive(Debug)]
pub struct PacketQueue {
    stream: StreamType,
    inner: Mutex<Inner>,
}

impl PacketQueue {
    pub fn new(stream: StreamType) -> Self {
        Self {
            stream,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream
    }

    pub fn queue_access_unit(&self, unit: AccessUnit) {
        let mut inner = self.inner.lock();
        if inner.format.is_none() {
            inner.format = unit.format.clone();
        }
        inner.latest_enqueued = Some(unit.meta());
        inner.entries.push_back(Entry::Unit(unit));
    }

    /// Queue a discontinuity marker. With `discard`, every queued access
    /// unit is dropped first and only earlier markers are kept.
    pub fn queue_discontinuity(&self, discontinuity: Discontinuity, discard: bool) {
        let mut inner = self.inner.lock();
        if discard {
            inner
                .entries
                .retain(|entry| matches!(entry, Entry::Discontinuity(_)));
        }
        inner.final_result = None;
        if discontinuity.kind == DiscontinuityKind::None && !discontinuity.swap {
            return;
        }
        inner.entries.push_back(Entry::Discontinuity(discontinuity));
    }

    pub fn dequeue(&self) -> Dequeued {
        let mut inner = self.inner.lock();
        match inner.entries.pop_front() {
            Some(Entry::Discontinuity(discontinuity)) => {
                if discontinuity.kind == DiscontinuityKind::FormatChange {
                    inner.format = None;
                }
                Dequeued::Discontinuity(discontinuity)
            }
            Some(Entry::Unit(unit)) => {
                if let Some(format) = &unit.format {
                    inner.format = Some(format.clone());
                }
                inner.latest_dequeued = Some(unit.meta());
                Dequeued::Unit(unit)
            }
            None => match &inner.final_result {
                None => Dequeued::WouldBlock,
                Some(IngestError::EndOfStream) => Dequeued::EndOfStream,
                Some(err) => Dequeued::Error(err.clone()),
            },
        }
    }

    /// Peek at the next entry: `Some(true)` for a discontinuity marker,
    /// `Some(false)` for an access unit.
    pub fn next_is_discontinuity(&self) -> Option<bool> {
        self.inner
            .lock()
            .entries
            .front()
            .map(|entry| matches!(entry, Entry::Discontinuity(_)))
    }

    /// Mark the queue final. Already queued entries stay readable.
    pub fn signal_eos(&self, result: IngestError) {
        let mut inner = self.inner.lock();
        if inner.final_result.is_none() {
            inner.final_result = Some(result);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::default();
    }

    pub fn has_buffer_available(&self) -> bool {
        !self.inner.lock().entries.is_empty()
    }

    pub fn has_data_buffer_available(&self) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|entry| matches!(entry, Entry::Unit(_)))
    }

    pub fn final_result(&self) -> Option<IngestError> {
        self.inner.lock().final_result.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().final_result.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> Option<Arc<MediaFormat>> {
        let inner = self.inner.lock();
        if let Some(format) = &inner.format {
            return Some(format.clone());
        }
        // Fall back to the first queued unit that knows its format.
        inner.entries.iter().find_map(|entry| match entry {
            Entry::Unit(unit) => unit.format.clone(),
            Entry::Discontinuity(_) => None,
        })
    }

    pub fn latest_enqueued_meta(&self) -> Option<UnitMeta> {
        self.inner.lock().latest_enqueued
    }

    pub fn latest_dequeued_meta(&self) -> Option<UnitMeta> {
        self.inner.lock().latest_dequeued
    }

    /// Timestamp of the next access unit, skipping markers.
    pub fn next_buffer_time_us(&self) -> Option<i64> {
        self.inner.lock().entries.iter().find_map(|entry| match entry {
            Entry::Unit(unit) => Some(unit.timestamp_us),
            Entry::Discontinuity(_) => None,
        })
    }

    /// Sum of the timestamp spans of every run of units between markers.
    pub fn buffered_duration_us(&self) -> i64 {
        let inner = self.inner.lock();
        let mut total = 0i64;
        let mut run: Option<(i64, i64)> = None;
        for entry in &inner.entries {
            match entry {
                Entry::Unit(unit) => {
                    let ts = unit.timestamp_us;
                    run = Some(match run {
                        None => (ts, ts),
                        Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
                    });
                }
                Entry::Discontinuity(_) => {
                    if let Some((lo, hi)) = run.take() {
                        total += hi - lo;
                    }
                }
            }
        }
        if let Some((lo, hi)) = run {
            total += hi - lo;
        }
        total
    }

    /// Move every entry of `other` to the back of this queue.
    ///
    /// Leading access units of `other` whose timestamp is not after
    /// `drop_until_us` are discarded; markers always move. A final result
    /// recorded on `other` carries over. `other` is left empty.
    pub fn transfer_from(&self, other: &PacketQueue, drop_until_us: Option<i64>) -> usize {
        let (entries, final_result, format) = {
            let mut src = other.inner.lock();
            let entries = std::mem::take(&mut src.entries);
            let final_result = src.final_result.take();
            let format = src.format.take();
            *src = Inner::default();
            (entries, final_result, format)
        };

        let mut inner = self.inner.lock();
        let mut dropping = drop_until_us.is_some();
        let mut moved = 0;
        for entry in entries {
            if let Entry::Unit(unit) = &entry {
                if dropping && drop_until_us.is_some_and(|limit| unit.timestamp_us <= limit) {
                    continue;
                }
                dropping = false;
                inner.latest_enqueued = Some(unit.meta());
                if inner.format.is_none() && format.is_some() {
                    inner.format = format.clone();
                }
            }
            inner.entries.push_back(entry);
            moved += 1;
        }
        if let Some(result) = final_result {
            inner.final_result.get_or_insert(result);
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(ts: i64) -> AccessUnit {
        AccessUnit::new(Bytes::from_static(&[0u8; 4]), ts)
    }

    #[test]
    fn discontinuities_keep_their_position() {
        let q = PacketQueue::new(StreamType::Audio);
        q.queue_access_unit(unit(0));
        q.queue_discontinuity(Discontinuity::new(DiscontinuityKind::TimeShift), false);
        q.queue_access_unit(unit(10));

        assert!(matches!(q.dequeue(), Dequeued::Unit(u) if u.timestamp_us == 0));
        assert!(matches!(q.dequeue(), Dequeued::Discontinuity(d) if d.kind == DiscontinuityKind::TimeShift));
        assert!(matches!(q.dequeue(), Dequeued::Unit(u) if u.timestamp_us == 10));
        assert!(matches!(q.dequeue(), Dequeued::WouldBlock));
    }

    #[test]
    fn eos_is_reported_after_drain() {
        let q = PacketQueue::new(StreamType::Video);
        q.queue_access_unit(unit(5));
        q.signal_eos(IngestError::EndOfStream);
        assert!(q.is_finished());
        assert!(matches!(q.dequeue(), Dequeued::Unit(_)));
        assert!(matches!(q.dequeue(), Dequeued::EndOfStream));

        let q = PacketQueue::new(StreamType::Video);
        q.signal_eos(IngestError::decryption("bad padding"));
        assert!(matches!(q.dequeue(), Dequeued::Error(IngestError::Decryption { .. })));
    }

    #[test]
    fn discard_keeps_only_markers() {
        let q = PacketQueue::new(StreamType::Audio);
        q.queue_access_unit(unit(0));
        q.queue_discontinuity(Discontinuity::new(DiscontinuityKind::TimeShift), false);
        q.queue_access_unit(unit(1));
        q.queue_discontinuity(Discontinuity::new(DiscontinuityKind::FormatChange), true);
        assert_eq!(q.len(), 2);
        assert!(!q.has_data_buffer_available());
    }

    #[test]
    fn buffered_duration_sums_runs() {
        let q = PacketQueue::new(StreamType::Video);
        for ts in [0, 1_000_000, 2_000_000] {
            q.queue_access_unit(unit(ts));
        }
        q.queue_discontinuity(Discontinuity::new(DiscontinuityKind::TimeShift), false);
        for ts in [50_000_000, 53_000_000] {
            q.queue_access_unit(unit(ts));
        }
        assert_eq!(q.buffered_duration_us(), 5_000_000);
        assert_eq!(q.next_buffer_time_us(), Some(0));
    }

    #[test]
    fn transfer_drops_overlap_and_keeps_marker() {
        let live = PacketQueue::new(StreamType::Video);
        let shadow = PacketQueue::new(StreamType::Video);
        live.queue_access_unit(unit(100));
        live.queue_access_unit(unit(200));

        shadow.queue_discontinuity(Discontinuity::swap(3), false);
        for ts in [150, 200, 250, 300] {
            shadow.queue_access_unit(unit(ts));
        }
        let moved = live.transfer_from(&shadow, Some(200));
        assert_eq!(moved, 3);
        assert!(shadow.is_empty());

        let mut seen = Vec::new();
        let mut swaps = 0;
        loop {
            match live.dequeue() {
                Dequeued::Unit(u) => seen.push(u.timestamp_us),
                Dequeued::Discontinuity(d) => {
                    assert!(d.swap);
                    swaps += 1;
                }
                _ => break,
            }
        }
        assert_eq!(seen, vec![100, 200, 250, 300]);
        assert_eq!(swaps, 1);
        assert_eq!(live.latest_enqueued_meta().unwrap().timestamp_us, 300);
    }
}
