//! Session controller.
//!
//! [`LiveSession`] is the public face of the pipeline. Mutating operations
//! are posted to a single controller task which owns the variant table,
//! the fetcher actors and the bandwidth estimator. Consumers pull access
//! units with [`LiveSession::dequeue_access_unit`] from any thread; that
//! path only touches the packet queues and the dequeue state behind the
//! swap mutex.
//!
//! A bandwidth switch runs the new variant's fetchers into shadow queues
//! while the old ones keep feeding the live queues. Once the new fetchers
//! report where they started, the old ones are told to stop at those
//! timestamps. When they have, the shadow contents are moved into the live
//! queues under the swap mutex and the old fetchers are torn down.

mod dequeue;
mod events;

pub use events::{SessionEvent, SessionEvents};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use url::Url;

use crate::bandwidth::{BandwidthEstimator, can_switch_up, select_bandwidth_index};
use crate::config::IngestConfig;
use crate::decryption::KeyCache;
use crate::error::{IngestError, Result};
use crate::fetcher::{
    FetcherContext, FetcherEvent, FetcherHandle, FetcherId, PacketSink, SinkMap, StartPosition,
    StartRequest,
};
use crate::format::MediaFormat;
use crate::net::{ByteFetcher, HttpByteFetcher};
use crate::playlist::{PlaylistFetch, TrackInfo, TrackKind, TrackList, VariantTable, fetch_playlist};
use crate::queue::{Dequeued, Discontinuity, DiscontinuityKind, PacketQueue, UnitMeta};
use crate::stream::{StreamMask, StreamType};

use dequeue::{DequeueState, QueueMap};
use events::EventSink;

/// State shared between the controller task and consumers.
#[derive(Debug)]
struct Shared {
    /// Live queues, one per stream type, for the whole session.
    queues: QueueMap,
    /// Doubles as the swap mutex.
    dequeue: Mutex<DequeueState>,
    events: EventSink,
    /// Longest duration reported by any fetcher, `-1` while unknown.
    duration_us: AtomicI64,
}

#[derive(Debug)]
enum Command {
    Connect {
        url: Url,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Seek {
        time_us: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    SelectTrack {
        index: usize,
        select: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    TrackInfo {
        reply: oneshot::Sender<Vec<TrackInfo>>,
    },
}

/// An adaptive HLS ingestion session.
///
/// Dropping the session cancels every task it spawned.
#[derive(Debug)]
pub struct LiveSession {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveSession {
    /// Create a session fetching through `fetcher`. Must be called from
    /// within a tokio runtime.
    pub fn new(config: IngestConfig, fetcher: Arc<dyn ByteFetcher>) -> (Self, SessionEvents) {
        let (events, stream) = EventSink::channel();
        let queues: QueueMap = StreamType::ALL
            .into_iter()
            .map(|stream| (stream, Arc::new(PacketQueue::new(stream))))
            .collect();
        let shared = Arc::new(Shared {
            queues,
            dequeue: Mutex::new(DequeueState::new(config.buffering.clone())),
            events,
            duration_us: AtomicI64::new(-1),
        });

        let cancel = CancellationToken::new();
        let (commands, receiver) = mpsc::unbounded_channel();
        let controller = Controller::new(config, fetcher, shared.clone(), receiver, cancel.clone());
        let task = tokio::spawn(controller.run().instrument(info_span!("session")));
        (
            Self {
                commands,
                shared,
                cancel,
                task,
            },
            stream,
        )
    }

    /// Create a session backed by an HTTP client built from `config.http`.
    pub fn with_http(config: IngestConfig) -> Result<(Self, SessionEvents)> {
        let fetcher = HttpByteFetcher::from_config(&config.http)?;
        Ok(Self::new(config, Arc::new(fetcher)))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| IngestError::internal("session controller is gone"))?;
        response
            .await
            .map_err(|_| IngestError::internal("session controller is gone"))
    }

    /// Load the playlist at `url` and start fetching. Preparation progress
    /// is reported through [`SessionEvent::Prepared`] or
    /// [`SessionEvent::PreparationFailed`].
    pub async fn connect(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).map_err(|e| IngestError::invalid_url(url, e))?;
        self.request(|reply| Command::Connect { url, reply }).await?
    }

    /// Stop every fetcher. Returns once all of them have exited and the
    /// queues are marked finished.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn seek_to(&self, time_us: i64) -> Result<()> {
        self.request(|reply| Command::Seek { time_us, reply }).await?
    }

    /// Select or deselect an alternative rendition by its index in
    /// [`LiveSession::track_info`].
    pub async fn select_track(&self, index: usize, select: bool) -> Result<()> {
        self.request(|reply| Command::SelectTrack {
            index,
            select,
            reply,
        })
        .await?
    }

    pub async fn track_info(&self) -> Result<Vec<TrackInfo>> {
        self.request(|reply| Command::TrackInfo { reply }).await
    }

    /// Next entry for `stream`. Never blocks.
    pub fn dequeue_access_unit(&self, stream: StreamType) -> Dequeued {
        let mut state = self.shared.dequeue.lock();
        state.dequeue(stream, &self.shared.queues, &self.shared.events)
    }

    pub fn stream_format(&self, stream: StreamType) -> Option<Arc<MediaFormat>> {
        if !self.active_streams().has(stream) {
            return None;
        }
        self.shared.queues.get(&stream)?.format()
    }

    pub fn active_streams(&self) -> StreamMask {
        self.shared.dequeue.lock().active()
    }

    pub fn duration_us(&self) -> Option<i64> {
        let duration = self.shared.duration_us.load(Ordering::Acquire);
        (duration >= 0).then_some(duration)
    }

    pub fn is_seekable(&self) -> bool {
        self.duration_us().is_some_and(|duration| duration > 0)
    }

    /// Whether the controller task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
struct FetcherRecord {
    handle: FetcherHandle,
    uri: Url,
    mask: StreamMask,
    temporarily_done: bool,
    duration_us: Option<i64>,
}

/// Bandwidth switch in flight.
#[derive(Debug)]
struct PendingSwitch {
    generation: u64,
    index: usize,
    uris: BTreeMap<StreamType, Url>,
    /// Shadow sinks of the new fetchers, per stream.
    sinks: SinkMap,
    new_fetchers: BTreeMap<FetcherId, FetcherRecord>,
    started: BTreeMap<FetcherId, BTreeMap<StreamType, i64>>,
    old_fetchers: Vec<FetcherId>,
    reached: BTreeSet<FetcherId>,
}

impl PendingSwitch {
    fn is_ready(&self) -> bool {
        self.started.len() == self.new_fetchers.len()
            && self.old_fetchers.iter().all(|id| self.reached.contains(id))
    }
}

struct Controller {
    config: Arc<IngestConfig>,
    context: FetcherContext,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    fetcher_events_tx: mpsc::UnboundedSender<FetcherEvent>,
    fetcher_events: mpsc::UnboundedReceiver<FetcherEvent>,
    cancel: CancellationToken,

    fetchers: BTreeMap<FetcherId, FetcherRecord>,
    next_fetcher_id: FetcherId,
    stream_uris: BTreeMap<StreamType, Url>,
    variants: Option<VariantTable>,
    tracks: TrackList,
    current_index: usize,
    estimator: BandwidthEstimator,
    switch: Option<PendingSwitch>,
    switch_generation: u64,
    last_seek_us: i64,
    duration_us: Option<i64>,

    connected: bool,
    prepared: bool,
    preparation_reported: bool,
    metadata_reported: bool,
}

impl Controller {
    fn new(
        config: IngestConfig,
        fetcher: Arc<dyn ByteFetcher>,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Self {
        let config = Arc::new(config);
        let (fetcher_events_tx, fetcher_events) = mpsc::unbounded_channel();
        Self {
            estimator: BandwidthEstimator::new(&config.bandwidth),
            context: FetcherContext {
                fetcher,
                keys: Arc::new(KeyCache::new()),
                config: config.clone(),
            },
            config,
            shared,
            commands,
            fetcher_events_tx,
            fetcher_events,
            cancel,
            fetchers: BTreeMap::new(),
            next_fetcher_id: 0,
            stream_uris: BTreeMap::new(),
            variants: None,
            tracks: TrackList::default(),
            current_index: 0,
            switch: None,
            switch_generation: 0,
            last_seek_us: 0,
            duration_us: None,
            connected: false,
            prepared: false,
            preparation_reported: false,
            metadata_reported: false,
        }
    }

    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.config.bandwidth.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.fetcher_events.recv() => {
                    self.handle_fetcher_event(event).await;
                    self.check_prepared();
                }
                _ = poll.tick() => {
                    self.check_prepared();
                    self.check_bandwidth().await;
                }
            }
        }
        debug!("Session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, reply } => {
                let result = self.connect(url).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Seek { time_us, reply } => {
                let result = self.seek(time_us).await;
                let _ = reply.send(result);
            }
            Command::SelectTrack {
                index,
                select,
                reply,
            } => {
                let result = self.select_track(index, select).await;
                let _ = reply.send(result);
            }
            Command::TrackInfo { reply } => {
                let _ = reply.send(self.tracks.track_info().to_vec());
            }
        }
    }

    async fn connect(&mut self, url: Url) -> Result<()> {
        if self.connected {
            return Err(IngestError::invalid_operation("session is already connected"));
        }
        info!(url = %url, "Connecting");
        let fetched = fetch_playlist(
            self.context.fetcher.as_ref(),
            &url,
            None,
            &self.config.playlist,
            &self.cancel,
        )
        .await;
        let playlist = match fetched {
            Ok(PlaylistFetch::Updated { playlist, .. }) => playlist,
            Ok(PlaylistFetch::Unchanged) => {
                return Err(self.preparation_failed(IngestError::internal("empty playlist fetch")));
            }
            Err(err) => return Err(self.preparation_failed(err)),
        };

        let variants = match playlist.variants() {
            Some(table) if table.is_empty() => {
                return Err(self.preparation_failed(IngestError::playlist(
                    "master playlist lists no variants",
                )));
            }
            Some(table) => {
                self.tracks = playlist.tracks().cloned().unwrap_or_default();
                table.clone()
            }
            None => VariantTable::single(playlist.url().clone()),
        };
        let index = variants.initial_index();
        info!(
            variants = variants.len(),
            tracks = self.tracks.len(),
            index,
            bandwidth = variants.bandwidth(index),
            "Playlist loaded"
        );
        self.variants = Some(variants);
        self.connected = true;
        self.change_configuration(Some(0), index, false).await;

        let mask = self.shared.dequeue.lock().active();
        self.shared.events.emit(SessionEvent::StreamsChanged { mask });
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.cancel_switch().await;
        let fetchers = std::mem::take(&mut self.fetchers);
        join_all(fetchers.into_values().map(|record| record.handle.stop())).await;
        for queue in self.shared.queues.values() {
            queue.signal_eos(IngestError::EndOfStream);
        }
        self.connected = false;
        info!("Disconnected");
    }

    async fn seek(&mut self, time_us: i64) -> Result<()> {
        if !self.connected {
            return Err(IngestError::invalid_operation("session is not connected"));
        }
        if !self.duration_us.is_some_and(|duration| duration > 0) {
            return Err(IngestError::invalid_operation("stream is not seekable"));
        }
        info!(time_us, "Seeking");
        self.change_configuration(Some(time_us.max(0)), self.current_index, false)
            .await;
        Ok(())
    }

    async fn select_track(&mut self, index: usize, select: bool) -> Result<()> {
        if self.tracks.select(index, select)? {
            info!(index, select, "Track selection changed");
            if self.connected {
                self.change_configuration(None, self.current_index, true)
                    .await;
            }
        }
        Ok(())
    }

    /// Media playlist URI per stream type for variant `index` under the
    /// current track selection.
    fn uris_for(&self, index: usize) -> BTreeMap<StreamType, Url> {
        let mut uris = BTreeMap::new();
        let Some(variant) = self.variants.as_ref().and_then(|v| v.get(index)) else {
            return uris;
        };
        for stream in variant.stream_mask.types() {
            if stream != StreamType::Subtitle {
                uris.insert(stream, variant.uri.clone());
            }
        }
        if let Some(group) = variant.audio_group.as_deref() {
            let track = self.tracks.selected_track(TrackKind::Audio, Some(group));
            if let Some(uri) = track.and_then(|t| t.uri.clone()) {
                uris.insert(StreamType::Audio, uri);
            }
        }
        if let Some(group) = variant.subtitle_group.as_deref() {
            let track = self.tracks.selected_track(TrackKind::Subtitle, Some(group));
            if let Some(uri) = track.and_then(|t| t.uri.clone()) {
                uris.insert(StreamType::Subtitle, uri);
            }
        }
        // Timed metadata rides along with audio when the variant playlist
        // itself serves no other stream.
        let main_used = uris
            .iter()
            .any(|(stream, uri)| *stream != StreamType::Metadata && *uri == variant.uri);
        if !main_used && uris.contains_key(&StreamType::Metadata) {
            match uris.get(&StreamType::Audio).cloned() {
                Some(audio) => uris.insert(StreamType::Metadata, audio),
                None => uris.remove(&StreamType::Metadata),
            };
        }
        uris
    }

    fn spawn_fetcher(&mut self, uri: Url, mask: StreamMask) -> FetcherRecord {
        let id = self.next_fetcher_id;
        self.next_fetcher_id += 1;
        debug!(id, uri = %uri, streams = ?mask, "Spawning fetcher");
        let handle = FetcherHandle::spawn(
            id,
            uri.clone(),
            &self.context,
            self.fetcher_events_tx.clone(),
            &self.cancel,
        );
        FetcherRecord {
            handle,
            uri,
            mask,
            temporarily_done: false,
            duration_us: None,
        }
    }

    fn live_sinks(&self, mask: StreamMask) -> SinkMap {
        mask.types()
            .filter_map(|stream| {
                let queue = self.shared.queues.get(&stream)?;
                Some((stream, PacketSink::new(queue.clone())))
            })
            .collect()
    }

    fn is_seekable(&self) -> bool {
        self.duration_us.is_some_and(|duration| duration > 0)
    }

    /// Move to variant `index`.
    ///
    /// With `time_us`, every fetcher is replaced and playback restarts at
    /// that time. With `pick_track`, only the streams whose rendition
    /// changed are restarted, at the consumer's position. Otherwise this is
    /// a seamless bandwidth switch.
    async fn change_configuration(&mut self, time_us: Option<i64>, index: usize, pick_track: bool) {
        self.cancel_switch().await;
        let wanted = self.uris_for(index);
        debug!(?time_us, index, pick_track, streams = ?mask_of(&wanted), "Changing configuration");

        match time_us {
            Some(time_us) => self.restart_at(time_us, wanted, index).await,
            None if pick_track => self.reselect_tracks(wanted).await,
            None => self.begin_switch(wanted, index).await,
        }
    }

    async fn restart_at(&mut self, time_us: i64, wanted: BTreeMap<StreamType, Url>, index: usize) {
        let fetchers = std::mem::take(&mut self.fetchers);
        join_all(fetchers.into_values().map(|record| record.handle.stop())).await;

        {
            let mut state = self.shared.dequeue.lock();
            for queue in self.shared.queues.values() {
                queue.clear();
            }
            state.set_active(mask_of(&wanted));
            state.reset_for_seek(time_us);
        }
        self.last_seek_us = time_us;
        self.current_index = index;

        for (uri, mask) in group_by_uri(&wanted) {
            let record = self.spawn_fetcher(uri, mask);
            record.handle.start(StartRequest {
                sinks: self.live_sinks(mask),
                position: StartPosition {
                    start_time_us: Some(time_us),
                    ..StartPosition::default()
                },
                switch_generation: self.switch_generation,
                mark_swap: false,
            });
            self.fetchers.insert(record.handle.id(), record);
        }
        self.stream_uris = wanted;
    }

    async fn reselect_tracks(&mut self, wanted: BTreeMap<StreamType, Url>) {
        let changed: StreamMask = StreamType::ALL
            .into_iter()
            .filter(|stream| wanted.get(stream) != self.stream_uris.get(stream))
            .collect();
        if changed.is_empty() {
            return;
        }
        let resume = self.consumer_position();
        let groups = group_by_uri(&wanted);

        let (kept, discarded): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.fetchers)
            .into_iter()
            .partition(|(_, record)| groups.contains_key(&record.uri));
        join_all(discarded.into_values().map(|record| record.handle.stop())).await;
        self.fetchers = kept;

        let retarget: Vec<FetcherId> = self
            .fetchers
            .iter()
            .filter(|(_, record)| groups.get(&record.uri) != Some(&record.mask))
            .map(|(id, _)| *id)
            .collect();
        for id in retarget {
            let Some(record) = self.fetchers.get(&id) else {
                continue;
            };
            record.handle.pause().await;
            let mask = groups.get(&record.uri).copied().unwrap_or_default();
            let sinks = self.live_sinks(mask);
            if let Some(record) = self.fetchers.get_mut(&id) {
                record.mask = mask;
                record.handle.start(StartRequest {
                    sinks,
                    position: StartPosition::default(),
                    switch_generation: self.switch_generation,
                    mark_swap: false,
                });
            }
        }

        {
            let mut state = self.shared.dequeue.lock();
            for stream in changed.types() {
                let Some(queue) = self.shared.queues.get(&stream) else {
                    continue;
                };
                queue.clear();
                if wanted.contains_key(&stream) {
                    queue.queue_discontinuity(Discontinuity::new(DiscontinuityKind::FormatChange), false);
                }
            }
            state.set_active(mask_of(&wanted));
        }

        let position = match resume {
            Some(meta) => StartPosition {
                segment_start_time_us: Some(meta.segment_start_us),
                discontinuity_seq: Some(meta.discontinuity_seq),
                ..StartPosition::default()
            },
            None => self.fallback_position(),
        };
        let served: BTreeSet<Url> = self.fetchers.values().map(|r| r.uri.clone()).collect();
        for (uri, mask) in groups {
            if served.contains(&uri) {
                continue;
            }
            let record = self.spawn_fetcher(uri, mask);
            record.handle.start(StartRequest {
                sinks: self.live_sinks(mask),
                position: position.clone(),
                switch_generation: self.switch_generation,
                mark_swap: false,
            });
            self.fetchers.insert(record.handle.id(), record);
        }
        self.stream_uris = wanted;
        let mask = mask_of(&self.stream_uris);
        self.shared.events.emit(SessionEvent::StreamsChanged { mask });
    }

    /// Earliest segment the consumer is reading from.
    fn consumer_position(&self) -> Option<UnitMeta> {
        self.shared
            .queues
            .values()
            .filter(|queue| queue.stream_type() != StreamType::Metadata)
            .filter_map(|queue| queue.latest_dequeued_meta())
            .min_by_key(|meta| meta.segment_start_us)
    }

    fn fallback_position(&self) -> StartPosition {
        StartPosition {
            start_time_us: self.is_seekable().then_some(self.last_seek_us),
            ..StartPosition::default()
        }
    }

    async fn begin_switch(&mut self, wanted: BTreeMap<StreamType, Url>, index: usize) {
        let groups = group_by_uri(&wanted);
        let old: Vec<FetcherId> = self
            .fetchers
            .iter()
            .filter(|(_, record)| !groups.contains_key(&record.uri))
            .map(|(id, _)| *id)
            .collect();
        let served: BTreeSet<&Url> = self.fetchers.values().map(|r| &r.uri).collect();
        let new_groups: Vec<(Url, StreamMask)> = groups
            .iter()
            .filter(|(uri, _)| !served.contains(uri))
            .map(|(uri, mask)| (uri.clone(), *mask))
            .collect();

        if new_groups.is_empty() {
            // Nothing new to fetch; the variant only drops renditions.
            for id in old {
                if let Some(record) = self.fetchers.remove(&id) {
                    record.handle.stop().await;
                }
            }
            self.shared.dequeue.lock().set_active(mask_of(&wanted));
            self.stream_uris = wanted;
            self.current_index = index;
            return;
        }

        self.switch_generation += 1;
        let generation = self.switch_generation;
        let changed: StreamMask = new_groups.iter().fold(StreamMask::empty(), |acc, (_, m)| acc | *m);
        let position = self.adaptive_position(changed);
        info!(
            from = self.current_index,
            to = index,
            generation,
            ?position,
            "Starting bandwidth switch"
        );

        let mut sinks = SinkMap::new();
        let mut new_fetchers = BTreeMap::new();
        for (uri, mask) in new_groups {
            let shadow: SinkMap = mask
                .types()
                .map(|stream| (stream, PacketSink::new(Arc::new(PacketQueue::new(stream)))))
                .collect();
            sinks.extend(shadow.iter().map(|(stream, sink)| (*stream, sink.clone())));
            let record = self.spawn_fetcher(uri, mask);
            record.handle.start(StartRequest {
                sinks: shadow,
                position: position.clone(),
                switch_generation: generation,
                mark_swap: true,
            });
            new_fetchers.insert(record.handle.id(), record);
        }

        self.switch = Some(PendingSwitch {
            generation,
            index,
            uris: wanted,
            sinks,
            new_fetchers,
            started: BTreeMap::new(),
            old_fetchers: old,
            reached: BTreeSet::new(),
        });
    }

    /// Start just after what the live queues of `changed` already hold.
    fn adaptive_position(&self, changed: StreamMask) -> StartPosition {
        let latest = changed
            .types()
            .filter(|stream| *stream != StreamType::Metadata)
            .filter_map(|stream| self.shared.queues.get(&stream)?.latest_enqueued_meta())
            .min_by_key(|meta| meta.segment_start_us);
        match latest {
            Some(meta) => StartPosition {
                start_time_us: None,
                segment_start_time_us: Some(meta.segment_start_us),
                discontinuity_seq: Some(meta.discontinuity_seq),
                adaptive: true,
            },
            None => self.fallback_position(),
        }
    }

    async fn cancel_switch(&mut self) {
        let Some(switch) = self.switch.take() else {
            return;
        };
        self.switch_generation += 1;
        info!(generation = switch.generation, "Cancelling bandwidth switch");
        join_all(switch.new_fetchers.into_values().map(|record| record.handle.stop())).await;
        for sink in switch.sinks.values() {
            sink.queue().clear();
        }
        for id in &switch.old_fetchers {
            if let Some(record) = self.fetchers.get(id) {
                record.handle.resume_until(BTreeMap::new(), self.switch_generation);
            }
        }
    }

    async fn on_started_at(&mut self, id: FetcherId, generation: u64, first: BTreeMap<StreamType, i64>) {
        let Some(switch) = self.switch.as_mut() else {
            return;
        };
        if generation != switch.generation || !switch.new_fetchers.contains_key(&id) {
            debug!(id, generation, "Ignoring stale start report");
            return;
        }
        debug!(id, ?first, "Switch target started");
        switch.started.insert(id, first);
        if switch.started.len() < switch.new_fetchers.len() {
            return;
        }

        let boundaries: BTreeMap<StreamType, i64> = switch
            .started
            .values()
            .flat_map(|first| first.iter().map(|(stream, ts)| (*stream, *ts)))
            .collect();
        for old_id in &switch.old_fetchers {
            let Some(record) = self.fetchers.get(old_id) else {
                switch.reached.insert(*old_id);
                continue;
            };
            let own: BTreeMap<StreamType, i64> = boundaries
                .iter()
                .filter(|(stream, _)| record.mask.has(**stream))
                .map(|(stream, ts)| (*stream, *ts))
                .collect();
            if own.is_empty() {
                switch.reached.insert(*old_id);
            } else {
                record.handle.resume_until(own, generation);
            }
        }
        self.try_complete_switch().await;
    }

    async fn on_stop_reached(&mut self, id: FetcherId, generation: u64) {
        let Some(switch) = self.switch.as_mut() else {
            return;
        };
        if generation != switch.generation || !switch.old_fetchers.contains(&id) {
            debug!(id, generation, "Ignoring stale stop report");
            return;
        }
        switch.reached.insert(id);
        self.try_complete_switch().await;
    }

    async fn try_complete_switch(&mut self) {
        if !self.switch.as_ref().is_some_and(PendingSwitch::is_ready) {
            return;
        }
        let Some(switch) = self.switch.take() else {
            return;
        };

        {
            let mut state = self.shared.dequeue.lock();
            for (stream, sink) in &switch.sinks {
                let Some(live) = self.shared.queues.get(stream) else {
                    continue;
                };
                let drop_until = live.latest_enqueued_meta().map(|meta| meta.timestamp_us);
                let moved = sink.redirect(live, drop_until);
                debug!(%stream, moved, ?drop_until, "Swapped packet source");
            }
            state.set_active(mask_of(&switch.uris));
        }

        let old: Vec<FetcherRecord> = switch
            .old_fetchers
            .iter()
            .filter_map(|id| self.fetchers.remove(id))
            .collect();
        join_all(old.into_iter().map(|record| record.handle.stop())).await;
        self.fetchers.extend(switch.new_fetchers);
        self.stream_uris = switch.uris;
        self.current_index = switch.index;

        let bandwidth = self
            .variants
            .as_ref()
            .map_or(0, |variants| variants.bandwidth(switch.index));
        info!(index = switch.index, bandwidth, generation = switch.generation, "Bandwidth switch complete");
        self.shared.events.emit(SessionEvent::BandwidthSwitched {
            index: switch.index,
            bandwidth,
        });
    }

    fn record_mut(&mut self, id: FetcherId) -> Option<&mut FetcherRecord> {
        if let Some(record) = self.fetchers.get_mut(&id) {
            return Some(record);
        }
        self.switch
            .as_mut()
            .and_then(|switch| switch.new_fetchers.get_mut(&id))
    }

    async fn handle_fetcher_event(&mut self, event: FetcherEvent) {
        let id = event.fetcher_id();
        if self.record_mut(id).is_none() {
            trace!(id, "Event from retired fetcher");
            return;
        }
        match event {
            FetcherEvent::Bandwidth { bytes, elapsed, .. } => {
                trace!(id, bytes, ?elapsed, "Bandwidth sample");
                self.estimator.add_sample(bytes, elapsed);
            }
            FetcherEvent::TemporarilyDone { .. } => {
                if let Some(record) = self.record_mut(id) {
                    record.temporarily_done = true;
                }
            }
            FetcherEvent::DurationUpdate { duration_us, .. } => {
                if let Some(record) = self.record_mut(id) {
                    record.duration_us = Some(duration_us);
                }
                self.update_duration();
            }
            FetcherEvent::MetadataDetected { .. } => {
                if !self.metadata_reported {
                    self.metadata_reported = true;
                    info!("Timed metadata detected");
                    self.shared.events.emit(SessionEvent::MetadataDetected);
                }
            }
            FetcherEvent::StartedAt {
                switch_generation,
                first_timestamps,
                ..
            } => {
                self.on_started_at(id, switch_generation, first_timestamps)
                    .await;
            }
            FetcherEvent::StopReached {
                switch_generation, ..
            } => self.on_stop_reached(id, switch_generation).await,
            FetcherEvent::Error { error, .. } => self.on_fetcher_error(id, error).await,
        }
    }

    fn update_duration(&mut self) {
        let durations = self.fetchers.values().filter_map(|r| r.duration_us);
        let duration = durations.max();
        if duration.is_none() || duration == self.duration_us {
            return;
        }
        self.duration_us = duration;
        if let Some(duration_us) = duration {
            self.shared.duration_us.store(duration_us, Ordering::Release);
            debug!(duration_us, "Duration updated");
            self.shared.events.emit(SessionEvent::DurationUpdate(duration_us));
        }
    }

    async fn on_fetcher_error(&mut self, id: FetcherId, error: IngestError) {
        if self
            .switch
            .as_ref()
            .is_some_and(|switch| switch.new_fetchers.contains_key(&id))
        {
            warn!(id, error = %error, "Switch target failed, staying on current variant");
            self.cancel_switch().await;
            return;
        }
        error!(id, error = %error, "Fetcher failed");
        let owned = self.fetchers.get(&id).map_or(StreamMask::empty(), |r| r.mask);
        for stream in owned.types() {
            if let Some(queue) = self.shared.queues.get(&stream) {
                queue.signal_eos(error.clone());
            }
        }
        if self.prepared {
            self.shared.events.emit(SessionEvent::Error(error));
        } else {
            self.preparation_failed(error);
        }
    }

    /// Report a preparation failure once and hand the error back.
    fn preparation_failed(&mut self, err: IngestError) -> IngestError {
        if !self.preparation_reported {
            self.preparation_reported = true;
            error!(error = %err, "Preparation failed");
            if matches!(err, IngestError::UnsupportedSource { .. }) {
                self.shared.events.emit(SessionEvent::SourceUnsupported);
            }
            self.shared
                .events
                .emit(SessionEvent::PreparationFailed(err.clone()));
        }
        err
    }

    fn check_prepared(&mut self) {
        if self.prepared || !self.connected || self.preparation_reported {
            return;
        }
        let owned = self
            .fetchers
            .values()
            .fold(StreamMask::empty(), |acc, record| acc | record.mask);
        let active = self.shared.dequeue.lock().active() & owned;
        let threshold = duration_us(self.config.buffering.prepare_threshold);
        let buffered = active
            .types()
            .filter(|stream| matches!(stream, StreamType::Audio | StreamType::Video))
            .filter_map(|stream| self.shared.queues.get(&stream))
            .all(|queue| queue.is_finished() || queue.buffered_duration_us() >= threshold)
            && !owned.is_empty();
        let all_done = !self.fetchers.is_empty() && self.fetchers.values().all(|r| r.temporarily_done);
        if buffered || all_done {
            self.prepared = true;
            self.shared.dequeue.lock().set_prepared(true);
            info!("Prepared");
            self.shared.events.emit(SessionEvent::Prepared);
        }
    }

    /// Most buffered on any active audio or video stream.
    fn max_buffered(&self) -> Duration {
        let active = self.shared.dequeue.lock().active();
        let us = active
            .types()
            .filter(|stream| matches!(stream, StreamType::Audio | StreamType::Video))
            .filter_map(|stream| self.shared.queues.get(&stream))
            .map(|queue| queue.buffered_duration_us())
            .max()
            .unwrap_or(0);
        Duration::from_micros(us.max(0) as u64)
    }

    async fn check_bandwidth(&mut self) {
        if !self.prepared || self.switch.is_some() || !self.config.bandwidth.adaptive {
            return;
        }
        let Some(variants) = self.variants.as_ref() else {
            return;
        };
        if variants.len() < 2 {
            return;
        }
        let Some(estimate) = self.estimator.estimate() else {
            return;
        };
        // Trust a sudden drop right away.
        let bps = if estimate.is_stable {
            estimate.bps
        } else {
            estimate.bps.min(estimate.short_term_bps)
        };

        let current = self.current_index;
        let mut index = select_bandwidth_index(variants, bps, current, &self.config.bandwidth);
        if index > current
            && !can_switch_up(
                self.max_buffered(),
                bps,
                variants.bandwidth(current),
                &self.config.bandwidth,
            )
        {
            index = current;
        }
        if index != current {
            info!(
                estimate_bps = bps,
                from = current,
                to = index,
                "Bandwidth estimate calls for another variant"
            );
            self.change_configuration(None, index, false).await;
        }
    }
}

fn mask_of(uris: &BTreeMap<StreamType, Url>) -> StreamMask {
    uris.keys().copied().collect()
}

/// Stream types served by each distinct URI.
fn group_by_uri(uris: &BTreeMap<StreamType, Url>) -> BTreeMap<Url, StreamMask> {
    let mut groups: BTreeMap<Url, StreamMask> = BTreeMap::new();
    for (stream, uri) in uris {
        *groups.entry(uri.clone()).or_default() |= stream.mask();
    }
    groups
}

fn duration_us(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}
