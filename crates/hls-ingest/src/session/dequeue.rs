//! Consumer-side state of a session: buffering hysteresis, the audio/video
//! twin wait, presentation time reconstruction across discontinuities and
//! HEVC parameter set replay after a seek.
//!
//! The state lives behind the session's swap mutex. A queue swap at the end
//! of a bandwidth switch takes the same lock, so a dequeue sees either the
//! old or the new producer, never both.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::events::{EventSink, SessionEvent};
use crate::config::BufferingConfig;
use crate::queue::{AccessUnit, Dequeued, Discontinuity, PacketQueue};
use crate::stream::{StreamMask, StreamType};

pub(crate) type QueueMap = BTreeMap<StreamType, Arc<PacketQueue>>;

#[derive(Debug, Default, Clone, Copy)]
struct TrackTiming {
    discontinuity_seq: Option<u32>,
    /// Source timestamp of the last unit handed out.
    last_source_us: Option<i64>,
    last_sample_duration_us: i64,
    buffering: bool,
}

#[derive(Debug)]
pub(crate) struct DequeueState {
    config: BufferingConfig,
    active: StreamMask,
    /// Streams restarted by a seek that have not produced a unit yet.
    switching: StreamMask,
    prepared: bool,
    last_seek_time_us: i64,
    /// First source timestamp seen per discontinuity sequence.
    abs_start_us: BTreeMap<u32, i64>,
    /// Presentation offset per discontinuity sequence.
    offset_us: BTreeMap<u32, i64>,
    tracks: [TrackTiming; 4],
    hevc_csd: Option<Bytes>,
    reinject_csd: bool,
}

impl DequeueState {
    pub fn new(config: BufferingConfig) -> Self {
        Self {
            config,
            active: StreamMask::empty(),
            switching: StreamMask::empty(),
            prepared: false,
            last_seek_time_us: 0,
            abs_start_us: BTreeMap::new(),
            offset_us: BTreeMap::new(),
            tracks: [TrackTiming::default(); 4],
            hevc_csd: None,
            reinject_csd: false,
        }
    }

    pub fn active(&self) -> StreamMask {
        self.active
    }

    pub fn set_active(&mut self, mask: StreamMask) {
        self.active = mask;
    }

    pub fn set_prepared(&mut self, prepared: bool) {
        self.prepared = prepared;
    }

    /// Restart the presentation timeline at `time_us`. The next HEVC video
    /// unit gets the last known parameter sets prepended if it lacks them.
    pub fn reset_for_seek(&mut self, time_us: i64) {
        self.last_seek_time_us = time_us;
        self.abs_start_us.clear();
        self.offset_us.clear();
        self.tracks = [TrackTiming::default(); 4];
        self.switching = self.active;
        self.reinject_csd = self.hevc_csd.is_some();
    }

    pub fn dequeue(&mut self, stream: StreamType, queues: &QueueMap, events: &EventSink) -> Dequeued {
        if !self.active.has(stream) {
            return Dequeued::WouldBlock;
        }
        let Some(queue) = queues.get(&stream) else {
            return Dequeued::WouldBlock;
        };

        if queue.next_is_discontinuity() == Some(true) {
            let marker = queue.dequeue();
            if let Dequeued::Discontinuity(discontinuity) = &marker {
                self.on_discontinuity(stream, discontinuity);
            }
            return marker;
        }

        let finished = queue.is_finished();
        if !queue.has_data_buffer_available() {
            if finished {
                return queue.dequeue();
            }
            self.set_buffering(stream, true, events);
            return Dequeued::WouldBlock;
        }

        if self.tracks[stream.index()].buffering && !finished && !self.switching.has(stream) {
            if queue.buffered_duration_us() < self.resume_threshold_us(queue) {
                return Dequeued::WouldBlock;
            }
            self.set_buffering(stream, false, events);
        }

        if self.waits_for_twin(stream, queue, queues) {
            return Dequeued::WouldBlock;
        }

        match queue.dequeue() {
            Dequeued::Unit(unit) => Dequeued::Unit(self.present(stream, unit)),
            other => other,
        }
    }

    fn on_discontinuity(&mut self, stream: StreamType, discontinuity: &Discontinuity) {
        // Markers pass through untouched. Timeline changes are keyed off the
        // discontinuity sequence carried by the units themselves.
        trace!(%stream, kind = ?discontinuity.kind, swap = discontinuity.swap, "Dequeued discontinuity");
    }

    fn resume_threshold_us(&self, queue: &PacketQueue) -> i64 {
        let threshold = duration_us(self.config.resume_threshold);
        match queue.latest_enqueued_meta() {
            Some(meta) if meta.target_duration_us > 0 => threshold.min(meta.target_duration_us),
            _ => threshold,
        }
    }

    fn set_buffering(&mut self, stream: StreamType, buffering: bool, events: &EventSink) {
        let was_any = self.any_buffering();
        let track = &mut self.tracks[stream.index()];
        if track.buffering == buffering {
            return;
        }
        track.buffering = buffering;
        let is_any = self.any_buffering();
        if !self.prepared || was_any == is_any {
            return;
        }
        debug!(%stream, buffering, "Buffering state changed");
        events.emit(if is_any {
            SessionEvent::BufferingStart
        } else {
            SessionEvent::BufferingEnd
        });
    }

    fn any_buffering(&self) -> bool {
        self.active
            .types()
            .any(|stream| self.tracks[stream.index()].buffering)
    }

    /// Audio and video are kept close together: a stream whose twin is
    /// starving may only run `twin_stream_max_lead` ahead of it.
    fn waits_for_twin(&self, stream: StreamType, queue: &PacketQueue, queues: &QueueMap) -> bool {
        let twin = match stream {
            StreamType::Audio => StreamType::Video,
            StreamType::Video => StreamType::Audio,
            StreamType::Subtitle | StreamType::Metadata => return false,
        };
        if !self.active.has(twin) {
            return false;
        }
        let Some(twin_queue) = queues.get(&twin) else {
            return false;
        };
        if twin_queue.has_data_buffer_available() || twin_queue.is_finished() {
            return false;
        }
        let own = self.tracks[stream.index()];
        let other = self.tracks[twin.index()];
        let (Some(twin_last), Some(next)) = (other.last_source_us, queue.next_buffer_time_us()) else {
            return true;
        };
        if own.discontinuity_seq.is_some() && own.discontinuity_seq != other.discontinuity_seq {
            return false;
        }
        next - twin_last > duration_us(self.config.twin_stream_max_lead)
    }

    fn present(&mut self, stream: StreamType, mut unit: AccessUnit) -> AccessUnit {
        self.switching.remove(stream.mask());
        unit.timestamp_us = self.presentation_time(stream, &unit);
        if stream == StreamType::Video && unit.format.as_ref().is_some_and(|f| f.is_hevc()) {
            self.handle_hevc_csd(&mut unit);
        }
        unit
    }

    fn presentation_time(&mut self, stream: StreamType, unit: &AccessUnit) -> i64 {
        let seq = unit.discontinuity_seq;
        let source_us = unit.timestamp_us;
        let track = self.tracks[stream.index()];

        if track.discontinuity_seq != Some(seq) {
            if !self.offset_us.contains_key(&seq) {
                let offset = match (track.discontinuity_seq, track.last_source_us) {
                    (Some(prev), Some(last)) => {
                        let prev_offset = self.offset_us.get(&prev).copied().unwrap_or(0);
                        let prev_start = self.abs_start_us.get(&prev).copied().unwrap_or(last);
                        prev_offset + (last - prev_start) + track.last_sample_duration_us
                    }
                    _ => 0,
                };
                debug!(%stream, discontinuity_seq = seq, offset_us = offset, "New timeline segment");
                self.offset_us.insert(seq, offset);
            }
            let track = &mut self.tracks[stream.index()];
            track.discontinuity_seq = Some(seq);
            track.last_source_us = None;
            track.last_sample_duration_us = 0;
        }

        let start = *self.abs_start_us.entry(seq).or_insert(source_us);
        let offset = self.offset_us.get(&seq).copied().unwrap_or(0);

        let track = &mut self.tracks[stream.index()];
        if let Some(last) = track.last_source_us {
            if source_us > last {
                track.last_sample_duration_us = source_us - last;
            }
        }
        track.last_source_us = Some(source_us);

        source_us - start + self.last_seek_time_us + offset
    }

    fn handle_hevc_csd(&mut self, unit: &mut AccessUnit) {
        match h265::cast_specific_data(&unit.data) {
            Some(len) => {
                self.hevc_csd = Some(unit.data.slice(..len));
            }
            None if self.reinject_csd => {
                if let Some(csd) = &self.hevc_csd {
                    debug!(bytes = csd.len(), "Replaying HEVC parameter sets after seek");
                    let mut data = BytesMut::with_capacity(csd.len() + unit.data.len());
                    data.extend_from_slice(csd);
                    data.extend_from_slice(&unit.data);
                    unit.data = data.freeze();
                    for range in &mut unit.sei {
                        *range = range.start + csd.len()..range.end + csd.len();
                    }
                }
            }
            None => {}
        }
        self.reinject_csd = false;
    }
}

fn duration_us(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}
