//! Message types exchanged between the session controller and segment
//! fetchers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;
use url::Url;

use crate::error::IngestError;
use crate::queue::{AccessUnit, Discontinuity, PacketQueue, UnitMeta};
use crate::stream::StreamType;

pub type FetcherId = u64;

/// Output slot of one stream type.
///
/// A fetcher writes through the slot; the controller can atomically move
/// the slot's contents into another queue and point the slot at it (the
/// queue swap that ends a bandwidth switch).
#[derive(Debug, Clone)]
pub struct PacketSink {
    slot: Arc<Mutex<Slot>>,
}

#[derive(Debug)]
struct Slot {
    queue: Arc<PacketQueue>,
    /// Units up to this timestamp are already in the queue from the
    /// previous producer. Cleared by the first later unit.
    skip_until_us: Option<i64>,
}

impl PacketSink {
    pub fn new(queue: Arc<PacketQueue>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                queue,
                skip_until_us: None,
            })),
        }
    }

    /// Queue currently behind the slot.
    pub fn queue(&self) -> Arc<PacketQueue> {
        self.slot.lock().queue.clone()
    }

    pub fn stream_type(&self) -> StreamType {
        self.slot.lock().queue.stream_type()
    }

    pub fn queue_access_unit(&self, unit: AccessUnit) {
        let mut slot = self.slot.lock();
        if let Some(limit) = slot.skip_until_us {
            if unit.timestamp_us <= limit {
                trace!(timestamp_us = unit.timestamp_us, limit, "Dropping overlapping unit");
                return;
            }
            slot.skip_until_us = None;
        }
        slot.queue.queue_access_unit(unit);
    }

    pub fn queue_discontinuity(&self, discontinuity: Discontinuity, discard: bool) {
        self.slot.lock().queue.queue_discontinuity(discontinuity, discard);
    }

    pub fn signal_eos(&self, result: IngestError) {
        self.slot.lock().queue.signal_eos(result);
    }

    pub fn buffered_duration_us(&self) -> i64 {
        self.slot.lock().queue.buffered_duration_us()
    }

    pub fn is_finished(&self) -> bool {
        self.slot.lock().queue.is_finished()
    }

    pub fn latest_enqueued_meta(&self) -> Option<UnitMeta> {
        self.slot.lock().queue.latest_enqueued_meta()
    }

    /// Move everything queued so far into `target` and write to `target`
    /// from now on. Units not after `drop_until_us` are dropped, both the
    /// ones already queued and the ones still to come, until the first
    /// later unit goes through.
    pub fn redirect(&self, target: &Arc<PacketQueue>, drop_until_us: Option<i64>) -> usize {
        let mut slot = self.slot.lock();
        if Arc::ptr_eq(&slot.queue, target) {
            return 0;
        }
        let moved = target.transfer_from(&slot.queue, drop_until_us);
        let caught_up = |limit: i64| {
            target
                .latest_enqueued_meta()
                .is_some_and(|meta| meta.timestamp_us > limit)
        };
        slot.skip_until_us = drop_until_us.filter(|limit| !caught_up(*limit));
        slot.queue = target.clone();
        moved
    }
}

/// Sinks a fetcher writes to, keyed by stream type.
pub type SinkMap = BTreeMap<StreamType, PacketSink>;

/// Where a (re)started fetcher begins.
#[derive(Debug, Clone, Default)]
pub struct StartPosition {
    /// Requested playback time, relative to the playlist start.
    pub start_time_us: Option<i64>,
    /// Playlist time of the segment the previous producer had reached.
    pub segment_start_time_us: Option<i64>,
    /// Discontinuity sequence that segment belonged to.
    pub discontinuity_seq: Option<u32>,
    /// Continue after an existing producer instead of overlapping it.
    pub adaptive: bool,
}

#[derive(Debug)]
pub struct StartRequest {
    pub sinks: SinkMap,
    pub position: StartPosition,
    /// Switch generation the fetcher reports back with.
    pub switch_generation: u64,
    /// Queue a swap marker ahead of the first unit.
    pub mark_swap: bool,
}

/// Requests handled by a fetcher actor, one variant per operation.
#[derive(Debug)]
pub enum FetcherCommand {
    Start(StartRequest),
    Pause {
        ack: oneshot::Sender<()>,
    },
    Seek {
        time_us: i64,
    },
    ChangeUri {
        uri: Url,
    },
    /// Keep fetching until every stream reaches its boundary timestamp. An
    /// empty map lifts an earlier boundary.
    ResumeUntil {
        boundaries: BTreeMap<StreamType, i64>,
        switch_generation: u64,
    },
}

/// Notifications posted by fetchers to the controller.
#[derive(Debug)]
pub enum FetcherEvent {
    /// First units of an adaptive start; timestamps are per stream.
    StartedAt {
        id: FetcherId,
        switch_generation: u64,
        first_timestamps: BTreeMap<StreamType, i64>,
    },
    StopReached {
        id: FetcherId,
        switch_generation: u64,
    },
    /// Buffer target reached; the fetcher idles until it drains.
    TemporarilyDone {
        id: FetcherId,
    },
    DurationUpdate {
        id: FetcherId,
        duration_us: i64,
    },
    MetadataDetected {
        id: FetcherId,
    },
    /// Transfer sample for bandwidth estimation.
    Bandwidth {
        id: FetcherId,
        bytes: u64,
        elapsed: Duration,
    },
    Error {
        id: FetcherId,
        error: IngestError,
    },
}

impl FetcherEvent {
    pub fn fetcher_id(&self) -> FetcherId {
        match self {
            Self::StartedAt { id, .. }
            | Self::StopReached { id, .. }
            | Self::TemporarilyDone { id }
            | Self::DurationUpdate { id, .. }
            | Self::MetadataDetected { id }
            | Self::Bandwidth { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Dequeued;

    #[test]
    fn redirect_moves_pending_units() {
        let shadow = Arc::new(PacketQueue::new(StreamType::Audio));
        let live = Arc::new(PacketQueue::new(StreamType::Audio));
        live.queue_access_unit(AccessUnit::new(bytes::Bytes::from_static(b"a"), 100));

        let sink = PacketSink::new(shadow.clone());
        sink.queue_discontinuity(Discontinuity::swap(3), false);
        sink.queue_access_unit(AccessUnit::new(bytes::Bytes::from_static(b"b"), 50));
        sink.queue_access_unit(AccessUnit::new(bytes::Bytes::from_static(b"c"), 150));

        assert_eq!(sink.redirect(&live, Some(100)), 2);
        assert!(Arc::ptr_eq(&sink.queue(), &live));
        assert!(shadow.is_empty());

        sink.queue_access_unit(AccessUnit::new(bytes::Bytes::from_static(b"d"), 200));
        let order: Vec<String> = std::iter::from_fn(|| match live.dequeue() {
            Dequeued::Unit(u) => Some(format!("u{}", u.timestamp_us)),
            Dequeued::Discontinuity(d) => Some(format!("swap{}", d.switch_generation)),
            _ => None,
        })
        .collect();
        assert_eq!(order, vec!["u100", "swap3", "u150", "u200"]);
    }

    #[test]
    fn redirect_keeps_dropping_until_past_the_limit() {
        let shadow = Arc::new(PacketQueue::new(StreamType::Audio));
        let live = Arc::new(PacketQueue::new(StreamType::Audio));
        for ts in [0, 100, 200] {
            live.queue_access_unit(AccessUnit::new(bytes::Bytes::from_static(b"o"), ts));
        }

        // The new producer has only reached the middle of the overlap.
        let sink = PacketSink::new(shadow.clone());
        sink.queue_discontinuity(Discontinuity::swap(1), false);
        sink.queue_access_unit(AccessUnit::new(bytes::Bytes::from_static(b"n"), 100));
        assert_eq!(sink.redirect(&live, Some(200)), 1);

        for ts in [200, 300, 250] {
            sink.queue_access_unit(AccessUnit::new(bytes::Bytes::from_static(b"n"), ts));
        }
        let order: Vec<String> = std::iter::from_fn(|| match live.dequeue() {
            Dequeued::Unit(u) => Some(format!("u{}", u.timestamp_us)),
            Dequeued::Discontinuity(d) => Some(format!("swap{}", d.switch_generation)),
            _ => None,
        })
        .collect();
        // Once a later unit went through, nothing else is filtered.
        assert_eq!(order, vec!["u0", "u100", "u200", "swap1", "u300", "u250"]);
    }
}
