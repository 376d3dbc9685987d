//! Segment fetcher actor.
//!
//! One fetcher runs per media playlist URI. It reloads the playlist on the
//! cadence of [`refresh::RefreshState`], downloads segments while its
//! queues hold less than the buffer target, decrypts and demuxes them and
//! writes the resulting access units into the [`PacketSink`]s it was
//! started with. The session controller drives it through
//! [`FetcherHandle`] and hears back through [`FetcherEvent`]s.

mod content;
mod download;
mod messages;
mod refresh;
mod sequence;

pub use messages::{
    FetcherCommand, FetcherEvent, FetcherId, PacketSink, SinkMap, StartPosition, StartRequest,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use url::Url;

use crate::config::IngestConfig;
use crate::decryption::{KeyCache, KeyFetcher};
use crate::error::{IngestError, Result};
use crate::net::ByteFetcher;
use crate::playlist::{PlaylistFetch, PlaylistSnapshot, fetch_playlist};
use crate::queue::{AccessUnit, Discontinuity, DiscontinuityKind};
use crate::stream::{StreamMask, StreamType};

use content::{Parsed, SegmentParser};
use download::download_segment;
use refresh::RefreshState;
use sequence::{SeqStatus, check_seq, resolve_start};

/// Shared collaborators every fetcher of a session uses.
#[derive(Clone)]
pub struct FetcherContext {
    pub fetcher: Arc<dyn ByteFetcher>,
    pub keys: Arc<KeyCache>,
    pub config: Arc<IngestConfig>,
}

impl std::fmt::Debug for FetcherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherContext")
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    Idle,
    Downloading,
    Paused,
    Stopped,
}

/// Handle to a running fetcher actor.
#[derive(Debug)]
pub struct FetcherHandle {
    id: FetcherId,
    commands: mpsc::UnboundedSender<FetcherCommand>,
    cancel: CancellationToken,
    /// Token of the operation in flight; cancelled to interrupt a download
    /// when a command has to take effect immediately.
    interrupt: Arc<Mutex<CancellationToken>>,
    task: JoinHandle<()>,
}

impl FetcherHandle {
    pub fn spawn(
        id: FetcherId,
        uri: Url,
        context: &FetcherContext,
        events: mpsc::UnboundedSender<FetcherEvent>,
        parent: &CancellationToken,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        let interrupt = Arc::new(Mutex::new(cancel.child_token()));
        let fetcher = SegmentFetcher::new(
            id,
            uri,
            context,
            receiver,
            events,
            cancel.clone(),
            interrupt.clone(),
        );
        let task = tokio::spawn(fetcher.run().instrument(info_span!("fetcher", id)));
        Self {
            id,
            commands,
            cancel,
            interrupt,
            task,
        }
    }

    pub fn id(&self) -> FetcherId {
        self.id
    }

    pub fn start(&self, request: StartRequest) {
        self.interrupt();
        self.send(FetcherCommand::Start(request));
    }

    /// Stop downloading. Resolves once the fetcher no longer writes.
    pub async fn pause(&self) {
        self.interrupt();
        let (ack, done) = oneshot::channel();
        self.send(FetcherCommand::Pause { ack });
        let _ = done.await;
    }

    pub fn seek(&self, time_us: i64) {
        self.interrupt();
        self.send(FetcherCommand::Seek { time_us });
    }

    pub fn change_uri(&self, uri: Url) {
        self.interrupt();
        self.send(FetcherCommand::ChangeUri { uri });
    }

    pub fn resume_until(&self, boundaries: BTreeMap<StreamType, i64>, switch_generation: u64) {
        self.send(FetcherCommand::ResumeUntil {
            boundaries,
            switch_generation,
        });
    }

    /// Cancel the actor and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(id = self.id, error = %e, "Fetcher task ended abnormally");
        }
    }

    fn interrupt(&self) {
        self.interrupt.lock().cancel();
    }

    fn send(&self, command: FetcherCommand) {
        if self.commands.send(command).is_err() {
            debug!(id = self.id, "Fetcher already exited");
        }
    }
}

/// What the run loop does after a monitor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Now,
    After(Duration),
    Idle,
}

/// Fetching state at the start of one segment, stamped onto its units.
#[derive(Debug, Clone, Copy, Default)]
struct SegmentStamp {
    discontinuity_seq: u32,
    target_duration_us: i64,
    seq: u64,
    start_us: i64,
}

/// Trimming applied until every stream has produced its first unit.
#[derive(Debug, Default)]
struct Startup {
    /// Units earlier than this offset into the start segment are dropped.
    offset_us: Option<i64>,
    base_us: Option<i64>,
    done: StreamMask,
}

impl Startup {
    fn accept(&mut self, stream: StreamType, unit: &AccessUnit) -> bool {
        if self.done.has(stream) {
            return true;
        }
        let base = *self.base_us.get_or_insert(unit.timestamp_us);
        if self
            .offset_us
            .is_some_and(|offset| unit.timestamp_us - base < offset)
        {
            return false;
        }
        // Video starts on a sync sample.
        if stream == StreamType::Video && !unit.is_sync {
            return false;
        }
        self.done |= stream.mask();
        true
    }
}

/// Routes parser output into the sinks, applying startup trimming, stop
/// boundaries and swap bookkeeping.
#[derive(Debug)]
struct SinkWriter {
    id: FetcherId,
    events: mpsc::UnboundedSender<FetcherEvent>,
    sinks: SinkMap,
    stamp: SegmentStamp,
    startup: Option<Startup>,
    switch_generation: u64,
    first_timestamps: BTreeMap<StreamType, i64>,
    report_started: bool,
    stop_at: Option<BTreeMap<StreamType, i64>>,
    stop_generation: u64,
    stopped: StreamMask,
    /// First segment a stop boundary dropped units from.
    rewind_seq: Option<u64>,
    /// Per stream, units up to this timestamp were queued before a rewind.
    skip_until: BTreeMap<StreamType, i64>,
    metadata_seen: bool,
}

impl SinkWriter {
    fn new(id: FetcherId, events: mpsc::UnboundedSender<FetcherEvent>) -> Self {
        Self {
            id,
            events,
            sinks: SinkMap::new(),
            stamp: SegmentStamp::default(),
            startup: None,
            switch_generation: 0,
            first_timestamps: BTreeMap::new(),
            report_started: false,
            stop_at: None,
            stop_generation: 0,
            stopped: StreamMask::empty(),
            rewind_seq: None,
            skip_until: BTreeMap::new(),
            metadata_seen: false,
        }
    }

    fn reset(&mut self, sinks: SinkMap, switch_generation: u64, mark_swap: bool) {
        if mark_swap {
            for sink in sinks.values() {
                sink.queue_discontinuity(Discontinuity::swap(switch_generation), false);
            }
        }
        self.sinks = sinks;
        self.switch_generation = switch_generation;
        self.first_timestamps.clear();
        self.report_started = mark_swap;
        self.stop_at = None;
        self.stopped = StreamMask::empty();
        self.rewind_seq = None;
        self.skip_until.clear();
        self.startup = None;
    }

    fn begin_startup(&mut self, offset_us: Option<i64>) {
        self.startup = Some(Startup {
            offset_us,
            ..Startup::default()
        });
    }

    fn has_stop_boundaries(&self) -> bool {
        self.stop_at.is_some()
    }

    /// Install stop boundaries. Returns true when every stream is already
    /// past its boundary.
    fn resume_until(&mut self, boundaries: BTreeMap<StreamType, i64>, generation: u64) -> bool {
        self.stopped = StreamMask::empty();
        for (stream, sink) in &self.sinks {
            let reached = match boundaries.get(stream) {
                Some(boundary) => sink
                    .latest_enqueued_meta()
                    .is_some_and(|meta| meta.timestamp_us >= *boundary),
                None => true,
            };
            if reached {
                self.stopped |= stream.mask();
            }
        }
        self.stop_at = Some(boundaries);
        self.stop_generation = generation;
        self.stop_complete()
    }

    /// Remove the stop boundaries. Returns the segment to fetch again when
    /// units were dropped at a boundary; units already queued from it are
    /// skipped on the second pass.
    fn lift_stop(&mut self) -> Option<u64> {
        self.stop_at = None;
        self.stopped = StreamMask::empty();
        let rewind = self.rewind_seq.take()?;
        for (stream, sink) in &self.sinks {
            if let Some(meta) = sink.latest_enqueued_meta() {
                self.skip_until.insert(*stream, meta.timestamp_us);
            }
        }
        Some(rewind)
    }

    fn stop_complete(&self) -> bool {
        self.stop_at.is_some() && self.sinks.keys().all(|stream| self.stopped.has(*stream))
    }

    /// Smallest amount buffered over the streams still open. Timed
    /// metadata is sparse and never holds a fetcher back.
    fn buffered(&self) -> Duration {
        let buffered = self
            .sinks
            .iter()
            .filter(|(stream, sink)| **stream != StreamType::Metadata && !sink.is_finished())
            .map(|(_, sink)| sink)
            .map(PacketSink::buffered_duration_us)
            .min();
        match buffered {
            Some(us) => Duration::from_micros(us.max(0) as u64),
            None => Duration::MAX,
        }
    }

    /// Fails with [`IngestError::OutOfRange`] once every stream reached its
    /// stop boundary.
    fn write(&mut self, parsed: Vec<Parsed>) -> Result<()> {
        for item in parsed {
            match item {
                Parsed::Unit(stream, unit) => self.write_unit(stream, unit),
                Parsed::Discontinuity(stream, discontinuity) => {
                    if self.stopped.has(stream) {
                        continue;
                    }
                    if let Some(sink) = self.sinks.get(&stream) {
                        sink.queue_discontinuity(discontinuity, false);
                    }
                }
            }
        }
        if self.report_started && self.has_started_all() {
            self.post_started();
        }
        if self.stop_complete() {
            return Err(IngestError::OutOfRange);
        }
        Ok(())
    }

    fn write_unit(&mut self, stream: StreamType, mut unit: AccessUnit) {
        let Some(sink) = self.sinks.get(&stream) else {
            trace!(%stream, "Dropping unit without a sink");
            return;
        };
        if self.stopped.has(stream) {
            self.rewind_seq.get_or_insert(self.stamp.seq);
            return;
        }
        if let Some(bounds) = &self.stop_at {
            let reached = bounds
                .get(&stream)
                .is_none_or(|boundary| unit.timestamp_us >= *boundary);
            if reached {
                debug!(%stream, timestamp_us = unit.timestamp_us, "Stop boundary reached");
                self.stopped |= stream.mask();
                self.rewind_seq.get_or_insert(self.stamp.seq);
                return;
            }
        }
        if let Some(limit) = self.skip_until.get(&stream).copied() {
            if unit.timestamp_us <= limit {
                return;
            }
            self.skip_until.remove(&stream);
        }
        if let Some(startup) = self.startup.as_mut()
            && !startup.accept(stream, &unit)
        {
            return;
        }

        unit.discontinuity_seq = self.stamp.discontinuity_seq;
        unit.target_duration_us = self.stamp.target_duration_us;
        unit.segment_seq = self.stamp.seq;
        unit.segment_start_us = self.stamp.start_us;
        if stream == StreamType::Metadata {
            self.metadata_seen = true;
        }
        self.first_timestamps.entry(stream).or_insert(unit.timestamp_us);
        trace!(%stream, timestamp_us = unit.timestamp_us, size = unit.data.len(), "Queue access unit");
        sink.queue_access_unit(unit);
    }

    fn has_started_all(&self) -> bool {
        self.sinks
            .keys()
            .filter(|stream| **stream != StreamType::Metadata)
            .all(|stream| self.first_timestamps.contains_key(stream))
    }

    /// Close sinks for streams the segments do not carry. `produced` is
    /// what the container announced so far.
    fn prune(&mut self, produced: StreamMask) {
        self.sinks.retain(|stream, sink| {
            if *stream == StreamType::Metadata || produced.has(*stream) {
                return true;
            }
            debug!(%stream, "Stream not present in segments");
            sink.signal_eos(IngestError::EndOfStream);
            false
        });
    }

    fn end_segment(&mut self) {
        if let Some(startup) = self.startup.as_mut() {
            startup.offset_us = None;
            if self
                .sinks
                .keys()
                .all(|stream| *stream == StreamType::Metadata || startup.done.has(*stream))
            {
                self.startup = None;
            }
        }
        if self.report_started && !self.first_timestamps.is_empty() {
            self.post_started();
        }
    }

    fn post_started(&mut self) {
        self.report_started = false;
        debug!(first = ?self.first_timestamps, "Adaptive start reached");
        let _ = self.events.send(FetcherEvent::StartedAt {
            id: self.id,
            switch_generation: self.switch_generation,
            first_timestamps: self.first_timestamps.clone(),
        });
    }

    fn signal_eos(&self, result: &IngestError) {
        for sink in self.sinks.values() {
            sink.signal_eos(result.clone());
        }
    }
}

struct SegmentFetcher {
    id: FetcherId,
    uri: Url,
    fetcher: Arc<dyn ByteFetcher>,
    keys: KeyFetcher,
    config: Arc<IngestConfig>,
    commands: mpsc::UnboundedReceiver<FetcherCommand>,
    events: mpsc::UnboundedSender<FetcherEvent>,
    cancel: CancellationToken,
    interrupt: Arc<Mutex<CancellationToken>>,
    state: FetcherState,
    wake_at: Option<Instant>,

    playlist: Option<PlaylistSnapshot>,
    raw_playlist: Option<Bytes>,
    fetched_at: Option<Instant>,
    refresh: RefreshState,
    refresh_failures: u32,
    reported_duration: Option<i64>,

    position: StartPosition,
    next_seq: Option<u64>,
    last_discontinuity_seq: Option<u32>,
    missed_boat_since: Option<Instant>,
    last_error: Option<IngestError>,

    parser: SegmentParser,
    writer: SinkWriter,
    reported_done: bool,
    metadata_reported: bool,
}

impl SegmentFetcher {
    fn new(
        id: FetcherId,
        uri: Url,
        context: &FetcherContext,
        commands: mpsc::UnboundedReceiver<FetcherCommand>,
        events: mpsc::UnboundedSender<FetcherEvent>,
        cancel: CancellationToken,
        interrupt: Arc<Mutex<CancellationToken>>,
    ) -> Self {
        let fetcher_config = &context.config.fetcher;
        let keys = KeyFetcher::new(
            context.fetcher.clone(),
            context.keys.clone(),
            fetcher_config.key_retry.clone(),
            fetcher_config.key_download_timeout,
        );
        Self {
            id,
            uri,
            fetcher: context.fetcher.clone(),
            keys,
            config: context.config.clone(),
            commands,
            writer: SinkWriter::new(id, events.clone()),
            events,
            cancel,
            interrupt,
            state: FetcherState::Idle,
            wake_at: None,
            playlist: None,
            raw_playlist: None,
            fetched_at: None,
            refresh: RefreshState::default(),
            refresh_failures: 0,
            reported_duration: None,
            position: StartPosition::default(),
            next_seq: None,
            last_discontinuity_seq: None,
            missed_boat_since: None,
            last_error: None,
            parser: SegmentParser::new(),
            reported_done: false,
            metadata_reported: false,
        }
    }

    async fn run(mut self) {
        debug!(uri = %self.uri, "Fetcher started");
        loop {
            let wake_at = self.wake_at;
            let monitoring = wake_at.is_some() && self.state == FetcherState::Downloading;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if monitoring => {
                    self.wake_at = None;
                    self.monitor().await;
                }
            }
        }
        self.state = FetcherState::Stopped;
        debug!(uri = %self.uri, "Fetcher stopped");
    }

    fn post(&self, event: FetcherEvent) {
        if self.events.send(event).is_err() {
            trace!("Session no longer listening");
        }
    }

    fn reset_interrupt(&self) {
        *self.interrupt.lock() = self.cancel.child_token();
    }

    /// Forget partial container state, keeping the sniffed container kind.
    fn reset_parser(&mut self) {
        self.parser
            .signal_discontinuity(DiscontinuityKind::TimeShift, None);
        self.parser.take_output();
    }

    fn handle_command(&mut self, command: FetcherCommand) {
        match command {
            FetcherCommand::Start(request) => {
                let StartRequest {
                    sinks,
                    position,
                    switch_generation,
                    mark_swap,
                } = request;
                let restart = position.start_time_us.is_some()
                    || position.segment_start_time_us.is_some()
                    || self.next_seq.is_none();
                if restart {
                    self.next_seq = None;
                    self.last_discontinuity_seq = None;
                    self.reset_parser();
                }
                debug!(
                    streams = ?sinks.keys().collect::<Vec<_>>(),
                    ?position,
                    switch_generation,
                    mark_swap,
                    "Start"
                );
                self.position = position;
                self.writer.reset(sinks, switch_generation, mark_swap);
                self.resume_downloading();
            }
            FetcherCommand::Pause { ack } => {
                debug!("Pause");
                self.reset_interrupt();
                if self.state != FetcherState::Stopped {
                    self.state = FetcherState::Paused;
                }
                self.wake_at = None;
                let _ = ack.send(());
            }
            FetcherCommand::Seek { time_us } => {
                debug!(time_us, "Seek");
                self.position = StartPosition {
                    start_time_us: Some(time_us),
                    ..StartPosition::default()
                };
                self.next_seq = None;
                self.last_discontinuity_seq = None;
                self.reset_parser();
                self.resume_downloading();
            }
            FetcherCommand::ChangeUri { uri } => {
                info!(from = %self.uri, to = %uri, "Changing playlist URI");
                self.reset_interrupt();
                self.uri = uri;
                self.playlist = None;
                self.raw_playlist = None;
                self.fetched_at = None;
                self.refresh = RefreshState::default();
                self.reported_duration = None;
                self.next_seq = None;
                self.last_discontinuity_seq = None;
                self.reset_parser();
                self.state = FetcherState::Paused;
                self.wake_at = None;
            }
            FetcherCommand::ResumeUntil {
                boundaries,
                switch_generation,
            } => {
                debug!(?boundaries, switch_generation, "Resume until");
                if boundaries.is_empty() {
                    if let Some(seq) = self.writer.lift_stop() {
                        debug!(seq, "Fetching the segment cut short by the stop boundary again");
                        self.next_seq = Some(seq);
                        self.reset_parser();
                    }
                    if self.state == FetcherState::Paused {
                        self.resume_downloading();
                    }
                    return;
                }
                let finished = self.state == FetcherState::Stopped;
                if self.writer.resume_until(boundaries, switch_generation) || finished {
                    self.report_stop_reached();
                } else if self.state == FetcherState::Paused {
                    self.resume_downloading();
                }
            }
        }
    }

    fn resume_downloading(&mut self) {
        self.reset_interrupt();
        self.state = FetcherState::Downloading;
        self.reported_done = false;
        self.wake_at = Some(Instant::now());
    }

    async fn monitor(&mut self) {
        let token = self.interrupt.lock().clone();
        match self.monitor_once(&token).await {
            Ok(Next::Now) => self.wake_at = Some(Instant::now()),
            Ok(Next::After(delay)) => self.wake_at = Some(Instant::now() + delay),
            Ok(Next::Idle) => self.wake_at = None,
            // A command interrupted the pass; it decides what comes next.
            Err(IngestError::Cancelled) => self.wake_at = Some(Instant::now()),
            Err(IngestError::OutOfRange) => self.report_stop_reached(),
            Err(err) => self.fail(err),
        }
    }

    fn playlist_due(&self) -> bool {
        let Some(playlist) = &self.playlist else {
            return true;
        };
        !playlist.is_complete() && self.time_until_refresh().is_zero()
    }

    fn time_until_refresh(&self) -> Duration {
        let (Some(playlist), Some(fetched_at)) = (&self.playlist, self.fetched_at) else {
            return Duration::ZERO;
        };
        if playlist.is_complete() {
            return self.config.fetcher.max_monitor_delay;
        }
        let last_segment = playlist
            .items()
            .last()
            .map_or(playlist.target_duration(), |item| {
                Duration::from_micros(item.duration_us.max(0) as u64)
            });
        self.refresh
            .min_playlist_age(playlist.target_duration(), last_segment)
            .saturating_sub(fetched_at.elapsed())
    }

    async fn monitor_once(&mut self, token: &CancellationToken) -> Result<Next> {
        if self.playlist_due() {
            if let Err(err) = self.refresh_playlist(token).await {
                if matches!(err, IngestError::Cancelled) {
                    return Err(err);
                }
                self.refresh_failures += 1;
                let fatal = self.refresh_failures > self.config.playlist.max_refresh_failures
                    || (self.playlist.is_none() && !err.is_retryable());
                if fatal {
                    return Err(err);
                }
                warn!(
                    uri = %self.uri,
                    failures = self.refresh_failures,
                    error = %err,
                    "Playlist refresh failed"
                );
                self.last_error = Some(err);
                return Ok(Next::After(self.config.fetcher.max_monitor_delay));
            }
        }
        let Some(playlist) = &self.playlist else {
            return Ok(Next::After(self.config.fetcher.max_monitor_delay));
        };

        let target = self.config.buffer_target(playlist.target_duration());
        let buffered = self.writer.buffered();
        if !self.writer.has_stop_boundaries() && buffered >= target {
            if !self.reported_done {
                trace!(?buffered, ?target, "Buffer target reached");
                self.reported_done = true;
                self.post(FetcherEvent::TemporarilyDone { id: self.id });
            }
            return Ok(Next::After(self.config.fetcher.max_monitor_delay));
        }
        self.download_next(token).await
    }

    async fn refresh_playlist(&mut self, token: &CancellationToken) -> Result<()> {
        let fetched = fetch_playlist(
            self.fetcher.as_ref(),
            &self.uri,
            self.raw_playlist.as_ref(),
            &self.config.playlist,
            token,
        )
        .await?;
        self.fetched_at = Some(Instant::now());
        self.refresh_failures = 0;
        match fetched {
            PlaylistFetch::Unchanged => {
                self.refresh = self.refresh.on_reload(false);
            }
            PlaylistFetch::Updated { playlist, raw } => {
                if playlist.is_variant_playlist() {
                    return Err(IngestError::playlist(format!(
                        "{} is a master playlist, expected a media playlist",
                        self.uri
                    )));
                }
                self.refresh = self.refresh.on_reload(true);
                debug!(
                    uri = %self.uri,
                    first_seq = ?playlist.first_seq(),
                    last_seq = ?playlist.last_seq(),
                    complete = playlist.is_complete(),
                    "Playlist updated"
                );
                if playlist.is_complete() {
                    let duration_us = playlist.total_duration_us();
                    if self.reported_duration != Some(duration_us) {
                        self.reported_duration = Some(duration_us);
                        self.post(FetcherEvent::DurationUpdate {
                            id: self.id,
                            duration_us,
                        });
                    }
                }
                self.raw_playlist = Some(raw);
                self.playlist = Some(playlist);
            }
        }
        Ok(())
    }

    async fn download_next(&mut self, token: &CancellationToken) -> Result<Next> {
        let live_start_offset = self.config.fetcher.live_start_offset;
        let (seq, status, item, is_last, target_duration_us) = {
            let Some(playlist) = &self.playlist else {
                return Ok(Next::After(self.config.fetcher.max_monitor_delay));
            };
            let seq = match self.next_seq {
                Some(seq) => seq,
                None => {
                    let Some(start) = resolve_start(playlist, &self.position, live_start_offset)
                    else {
                        return Ok(Next::After(self.time_until_refresh()));
                    };
                    debug!(seq = start.seq, offset_us = ?start.offset_us, "Resolved start segment");
                    self.writer.begin_startup(start.offset_us);
                    self.next_seq = Some(start.seq);
                    start.seq
                }
            };
            let status = check_seq(playlist, seq, live_start_offset);
            let item = playlist.item_for_seq(seq).cloned();
            let is_last = playlist.is_complete() && playlist.last_seq() == Some(seq);
            let target_duration_us = playlist.meta().map_or(0, |meta| meta.target_duration_us);
            (seq, status, item, is_last, target_duration_us)
        };

        match status {
            SeqStatus::Available => {}
            SeqStatus::Ahead => return Ok(Next::After(self.time_until_refresh())),
            SeqStatus::Finished => return self.finish(),
            SeqStatus::MissedTheBoat { resume_at } => {
                if self.writer.has_stop_boundaries() {
                    return Err(IngestError::OutOfRange);
                }
                let since = *self.missed_boat_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.config.fetcher.missed_boat_budget {
                    return Err(self.last_error.take().unwrap_or(IngestError::EndOfStream));
                }
                info!(seq, resume_at, "Missed the boat, jumping into the live window");
                self.parser
                    .signal_discontinuity(DiscontinuityKind::DataCorruption, None);
                self.writer.write(self.parser.take_output())?;
                self.next_seq = Some(resume_at);
                return Ok(Next::Now);
            }
        }
        let Some(item) = item else {
            return Err(IngestError::internal(format!("segment {seq} vanished from playlist")));
        };

        if self
            .last_discontinuity_seq
            .is_some_and(|last| last != item.discontinuity_seq)
        {
            debug!(seq, discontinuity_seq = item.discontinuity_seq, "Playlist discontinuity");
            self.parser
                .signal_discontinuity(DiscontinuityKind::FormatChange, None);
            self.writer.write(self.parser.take_output())?;
        }

        self.writer.stamp = SegmentStamp {
            discontinuity_seq: item.discontinuity_seq,
            target_duration_us,
            seq,
            start_us: item.start_us,
        };
        debug!(seq, uri = %item.uri, encrypted = item.cipher.is_some(), "Downloading segment");

        let parser = &mut self.parser;
        let writer = &mut self.writer;
        let result = download_segment(
            self.fetcher.as_ref(),
            &self.keys,
            &self.config.fetcher,
            &item,
            token,
            |block| {
                parser.feed(block)?;
                writer.write(parser.take_output())
            },
        )
        .await;

        let stats = match result {
            Ok(stats) => stats,
            Err(err @ IngestError::StreamReset { .. }) => {
                warn!(seq, error = %err, "Segment broke off, skipping to the next one");
                self.last_error = Some(err);
                self.parser
                    .signal_discontinuity(DiscontinuityKind::DataCorruption, None);
                self.writer.write(self.parser.take_output())?;
                self.next_seq = Some(seq + 1);
                return Ok(Next::Now);
            }
            Err(err) => return Err(err),
        };

        self.missed_boat_since = None;
        self.parser.finish_segment(item.start_us)?;
        self.writer.write(self.parser.take_output())?;
        if stats.bytes > 0 {
            self.writer.prune(self.parser.stream_mask());
        }
        self.writer.end_segment();
        self.last_discontinuity_seq = Some(item.discontinuity_seq);
        self.next_seq = Some(seq + 1);
        self.reported_done = false;

        if stats.bytes > 0 {
            self.post(FetcherEvent::Bandwidth {
                id: self.id,
                bytes: stats.bytes,
                elapsed: stats.elapsed,
            });
        }
        if !self.metadata_reported && (self.writer.metadata_seen || self.parser.has_metadata()) {
            self.metadata_reported = true;
            self.post(FetcherEvent::MetadataDetected { id: self.id });
        }

        if is_last {
            if stats.bytes == 0 {
                warn!(seq, uri = %item.uri, "Final segment is empty, treating it as end of stream");
            }
            return self.finish();
        }
        Ok(Next::Now)
    }

    /// The complete playlist is exhausted.
    fn finish(&mut self) -> Result<Next> {
        if self.writer.has_stop_boundaries() {
            return Err(IngestError::OutOfRange);
        }
        let flushed = self.parser.signal_eos();
        self.writer.write(self.parser.take_output())?;
        flushed?;
        debug!(uri = %self.uri, "Reached end of playlist");
        self.writer.signal_eos(&IngestError::EndOfStream);
        self.state = FetcherState::Stopped;
        Ok(Next::Idle)
    }

    fn report_stop_reached(&mut self) {
        debug!(switch_generation = self.writer.stop_generation, "Stop reached");
        if self.state != FetcherState::Stopped {
            self.state = FetcherState::Paused;
        }
        self.wake_at = None;
        self.post(FetcherEvent::StopReached {
            id: self.id,
            switch_generation: self.writer.stop_generation,
        });
    }

    fn fail(&mut self, err: IngestError) {
        self.state = FetcherState::Stopped;
        self.wake_at = None;
        if err.is_end_of_stream() {
            debug!(uri = %self.uri, "Fetcher reached end of stream");
            self.writer.signal_eos(&IngestError::EndOfStream);
            return;
        }
        error!(uri = %self.uri, error = %err, "Fetcher failed");
        self.writer.signal_eos(&err);
        self.post(FetcherEvent::Error { id: self.id, error: err });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::{MemoryFetcher, RetryPolicy};
    use crate::queue::{Dequeued, PacketQueue};
    use crate::reassembler::tests::adts_frame;
    use crate::ts_demux::tests::{packetize, pat, pes, pmt};

    /// 1024 samples at 48 kHz in 90 kHz ticks.
    pub(crate) const AAC_FRAME_TICKS: u64 = 1920;

    /// TS segment carrying `frames` ADTS frames starting at `first_pts`.
    pub(crate) fn ts_segment(first_pts: u64, frames: usize) -> Vec<u8> {
        let mut data = pat(0x100);
        data.extend(pmt(0x100, &[(0x0F, 0x101)]));
        let mut cc = 0;
        for i in 0..frames {
            let frame = adts_frame(3, 2, &[i as u8; 16]);
            let pts = first_pts + i as u64 * AAC_FRAME_TICKS;
            data.extend(packetize(0x101, &pes(0xC0, pts, &frame, true), &mut cc));
        }
        data
    }

    /// VOD or live media playlist of `count` segments with `frames` frames
    /// each, registered on `fetcher` under `base`.
    pub(crate) fn serve_playlist(
        fetcher: &MemoryFetcher,
        base: &str,
        first_seq: u64,
        count: usize,
        frames: usize,
        complete: bool,
    ) -> Url {
        let duration = frames as f64 * AAC_FRAME_TICKS as f64 / 90_000.0;
        let mut text = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:{first_seq}\n",
            duration.ceil() as u64
        );
        for i in 0..count {
            let seq = first_seq + i as u64;
            let uri = Url::parse(&format!("{base}seg{seq}.ts")).unwrap();
            let first_pts = 900_000 + seq * frames as u64 * AAC_FRAME_TICKS;
            fetcher.insert(&uri, ts_segment(first_pts, frames));
            text.push_str(&format!("#EXTINF:{duration:.3},\nseg{seq}.ts\n"));
        }
        if complete {
            text.push_str("#EXT-X-ENDLIST\n");
        }
        let url = Url::parse(&format!("{base}index.m3u8")).unwrap();
        fetcher.insert(&url, text.into_bytes());
        url
    }

    pub(crate) fn context(fetcher: &MemoryFetcher) -> FetcherContext {
        context_with(fetcher, |_| {})
    }

    fn context_with(fetcher: &MemoryFetcher, tune: impl FnOnce(&mut IngestConfig)) -> FetcherContext {
        let mut config = IngestConfig::default();
        config.fetcher.segment_retry.max_retries = 1;
        config.fetcher.segment_retry.base_delay = Duration::from_millis(1);
        config.playlist.retry.max_retries = 0;
        config.fetcher.max_monitor_delay = Duration::from_millis(20);
        tune(&mut config);
        FetcherContext {
            fetcher: Arc::new(fetcher.clone()),
            keys: Arc::new(KeyCache::new()),
            config: Arc::new(config),
        }
    }

    fn audio_sink() -> (Arc<PacketQueue>, SinkMap) {
        let queue = Arc::new(PacketQueue::new(StreamType::Audio));
        let sinks = SinkMap::from([(StreamType::Audio, PacketSink::new(queue.clone()))]);
        (queue, sinks)
    }

    fn drain(queue: &PacketQueue) -> (Vec<i64>, usize, bool) {
        let mut units = Vec::new();
        let mut markers = 0;
        loop {
            match queue.dequeue() {
                Dequeued::Unit(unit) => units.push(unit.timestamp_us),
                Dequeued::Discontinuity(_) => markers += 1,
                Dequeued::EndOfStream => return (units, markers, true),
                Dequeued::WouldBlock | Dequeued::Error(_) => return (units, markers, false),
            }
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn vod_playlist_runs_to_end_of_stream() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/vod/", 0, 3, 20, true);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(1, url, &context(&memory), events_tx, &CancellationToken::new());

        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition {
                start_time_us: Some(0),
                ..StartPosition::default()
            },
            switch_generation: 0,
            mark_swap: false,
        });
        wait_for(|| queue.is_finished()).await;

        let (units, markers, eos) = drain(&queue);
        assert!(eos);
        assert_eq!(markers, 0);
        assert_eq!(units.len(), 60);
        assert!(units.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(units[0], 10_000_000);

        let mut duration = None;
        let mut samples = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                FetcherEvent::DurationUpdate { duration_us, .. } => duration = Some(duration_us),
                FetcherEvent::Bandwidth { .. } => samples += 1,
                _ => {}
            }
        }
        // Three segments announced as 0.427 s each.
        let duration = duration.unwrap();
        assert!((duration - 1_281_000).abs() <= 3, "duration {duration}");
        assert_eq!(samples, 3);
        handle.stop().await;
    }

    #[tokio::test]
    async fn interrupted_body_is_resumed_with_a_range() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/resume/", 0, 1, 40, true);
        let segment = Url::parse("memory://cdn/resume/seg0.ts").unwrap();
        memory.break_after(&segment, 188 * 10);

        let (events_tx, _events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(2, url, &context(&memory), events_tx, &CancellationToken::new());
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition::default(),
            switch_generation: 0,
            mark_swap: false,
        });
        wait_for(|| queue.is_finished()).await;

        let (units, markers, _) = drain(&queue);
        assert_eq!(units.len(), 40);
        assert_eq!(markers, 0);
        assert!(
            memory
                .requests()
                .iter()
                .any(|r| r.url == segment && r.range.is_some_and(|range| range.first == 1880))
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn seek_trims_to_offset_inside_segment() {
        let memory = MemoryFetcher::new();
        // Segments of 40 frames, 0.853 s each.
        let url = serve_playlist(&memory, "memory://cdn/seek/", 0, 3, 40, true);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(3, url, &context(&memory), events_tx, &CancellationToken::new());
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition {
                start_time_us: Some(1_000_000),
                ..StartPosition::default()
            },
            switch_generation: 0,
            mark_swap: false,
        });
        wait_for(|| queue.is_finished()).await;

        let (units, _, _) = drain(&queue);
        // Segment 1 starts at frame 40; the offset of 0.147 s skips 7 frames.
        let first_expected = ((900_000 + 47 * AAC_FRAME_TICKS) * 100 / 9) as i64;
        assert_eq!(units[0], first_expected);
        assert_eq!(units.len(), 120 - 47);
        handle.stop().await;
    }

    #[tokio::test]
    async fn swap_marker_and_stop_boundary() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/swap/", 0, 3, 20, true);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = FetcherHandle::spawn(4, url, &context(&memory), events_tx, &token);

        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition {
                segment_start_time_us: Some(0),
                discontinuity_seq: Some(0),
                adaptive: true,
                ..StartPosition::default()
            },
            switch_generation: 7,
            mark_swap: true,
        });

        let started = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(FetcherEvent::StartedAt {
                    switch_generation,
                    first_timestamps,
                    ..
                }) = events.recv().await
                {
                    return (switch_generation, first_timestamps);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(started.0, 7);
        // Adaptive start skips the segment the previous producer covers.
        let first_audio = started.1[&StreamType::Audio];
        assert_eq!(first_audio, ((900_000 + 20 * AAC_FRAME_TICKS) * 100 / 9) as i64);
        assert!(matches!(
            queue.dequeue(),
            Dequeued::Discontinuity(Discontinuity { swap: true, switch_generation: 7, .. })
        ));

        handle.resume_until(BTreeMap::from([(StreamType::Audio, first_audio)]), 7);
        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(FetcherEvent::StopReached {
                        switch_generation, ..
                    }) => return switch_generation,
                    Some(_) => continue,
                    None => return 0,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(stopped, 7);
        handle.stop().await;
    }

    async fn next_stop_reached(events: &mut mpsc::UnboundedReceiver<FetcherEvent>) -> u64 {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(FetcherEvent::StopReached {
                        switch_generation, ..
                    }) => return switch_generation,
                    Some(_) => continue,
                    None => return 0,
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn lifted_stop_resumes_without_repeating_units() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/lift/", 0, 3, 20, true);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(8, url, &context(&memory), events_tx, &CancellationToken::new());
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition {
                start_time_us: Some(0),
                ..StartPosition::default()
            },
            switch_generation: 0,
            mark_swap: false,
        });
        // Boundary in the middle of segment 1.
        let boundary = ((900_000 + 30 * AAC_FRAME_TICKS) * 100 / 9) as i64;
        handle.resume_until(BTreeMap::from([(StreamType::Audio, boundary)]), 3);
        assert_eq!(next_stop_reached(&mut events).await, 3);
        assert_eq!(queue.len(), 30);
        assert!(!queue.is_finished());

        // The switch was called off: the fetcher picks up where it stopped.
        handle.resume_until(BTreeMap::new(), 4);
        wait_for(|| queue.is_finished()).await;

        let (units, _, eos) = drain(&queue);
        assert!(eos);
        assert_eq!(units.len(), 60);
        assert!(units.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(units[30], boundary);
        handle.stop().await;
    }

    #[tokio::test]
    async fn missing_segment_fails_the_streams() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/broken/", 0, 2, 10, true);
        memory.remove(&Url::parse("memory://cdn/broken/seg1.ts").unwrap());

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(5, url, &context(&memory), events_tx, &CancellationToken::new());
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition::default(),
            switch_generation: 0,
            mark_swap: false,
        });
        wait_for(|| queue.is_finished()).await;

        let (units, _, eos) = drain(&queue);
        assert_eq!(units.len(), 10);
        assert!(!eos);
        assert!(matches!(queue.dequeue(), Dequeued::Error(IngestError::HttpStatus { .. })));

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(event, FetcherEvent::Error { id: 5, .. });
        }
        assert!(saw_error);
        handle.stop().await;
    }

    #[tokio::test]
    async fn pause_acknowledges_and_stops_writing() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/live/", 100, 6, 20, false);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(6, url, &context(&memory), events_tx, &CancellationToken::new());
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition::default(),
            switch_generation: 0,
            mark_swap: false,
        });
        wait_for(|| queue.len() >= 60).await;

        handle.pause().await;
        let len = queue.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len(), len);

        // Live start is three segments before the edge.
        let first = match queue.dequeue() {
            Dequeued::Unit(unit) => unit,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(first.segment_seq, 102);
        handle.stop().await;
    }

    /// Queue contents as segment numbers, with `None` for a marker.
    fn drain_segments(queue: &PacketQueue) -> Vec<Option<u64>> {
        let mut entries = Vec::new();
        loop {
            match queue.dequeue() {
                Dequeued::Unit(unit) => entries.push(Some(unit.segment_seq)),
                Dequeued::Discontinuity(_) => entries.push(None),
                _ => return entries,
            }
        }
    }

    fn start_live(handle: &FetcherHandle) -> Arc<PacketQueue> {
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition::default(),
            switch_generation: 0,
            mark_swap: false,
        });
        queue
    }

    #[tokio::test]
    async fn missed_window_jumps_ahead_behind_a_corruption_marker() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/missed/", 100, 6, 20, false);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(9, url, &context(&memory), events_tx, &CancellationToken::new());
        let queue = start_live(&handle);
        // Segments 102 to 105, then the fetcher waits at the live edge.
        wait_for(|| queue.len() >= 80).await;

        // The window moves on to 110..116 before 106 was fetched.
        serve_playlist(&memory, "memory://cdn/missed/", 110, 6, 20, false);
        wait_for(|| queue.len() >= 120).await;
        handle.pause().await;

        let entries = drain_segments(&queue);
        let marker = entries.iter().position(Option::is_none).unwrap();
        assert_eq!(marker, 80);
        assert!(entries[..marker].iter().flatten().all(|seq| (102..=105).contains(seq)));
        assert_eq!(entries.iter().filter(|e| e.is_none()).count(), 1);
        // Resumes three segments before the new edge.
        assert_eq!(entries[marker + 1], Some(112));
        handle.stop().await;
    }

    #[tokio::test]
    async fn missed_window_without_budget_ends_the_stream() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/nobudget/", 100, 6, 20, false);
        let context = context_with(&memory, |config| {
            config.fetcher.missed_boat_budget = Duration::ZERO;
        });
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(10, url, &context, events_tx, &CancellationToken::new());
        let queue = start_live(&handle);
        wait_for(|| queue.len() >= 80).await;

        serve_playlist(&memory, "memory://cdn/nobudget/", 110, 6, 20, false);
        wait_for(|| queue.is_finished()).await;

        let (units, markers, eos) = drain(&queue);
        assert_eq!(units.len(), 80);
        assert_eq!(markers, 0);
        assert!(eos);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, FetcherEvent::Error { .. }));
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn segment_breaking_twice_is_skipped_with_a_marker() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/reset/", 0, 3, 20, true);
        let segment = Url::parse("memory://cdn/reset/seg1.ts").unwrap();
        // The first read and its ranged resume both break off.
        memory.break_after(&segment, 188 * 10);
        memory.break_after(&segment, 188 * 10);

        let (events_tx, _events) = mpsc::unbounded_channel();
        let handle = FetcherHandle::spawn(11, url, &context(&memory), events_tx, &CancellationToken::new());
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition::default(),
            switch_generation: 0,
            mark_swap: false,
        });
        wait_for(|| queue.is_finished()).await;

        let (units, markers, eos) = drain(&queue);
        assert!(eos);
        assert_eq!(markers, 1);
        assert!(units.len() >= 40 && units.len() < 60, "{} units", units.len());
        assert!(units.windows(2).all(|w| w[0] < w[1]));
        let seg2_first = ((900_000 + 40 * AAC_FRAME_TICKS) * 100 / 9) as i64;
        assert_eq!(units[units.len() - 20], seg2_first);
        assert_eq!(memory.request_count(&segment), 2);
        handle.stop().await;
    }

    fn patient_opens(config: &mut IngestConfig) {
        config.fetcher.segment_retry = RetryPolicy {
            max_retries: u32::MAX,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: false,
        };
        config.fetcher.open_failure_timeout = Duration::from_millis(150);
    }

    #[tokio::test]
    async fn refused_open_is_retried() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/refused/", 0, 1, 20, true);
        let segment = Url::parse("memory://cdn/refused/seg0.ts").unwrap();
        memory.refuse(&segment, 3);

        let (events_tx, _events) = mpsc::unbounded_channel();
        let context = context_with(&memory, patient_opens);
        let handle = FetcherHandle::spawn(12, url, &context, events_tx, &CancellationToken::new());
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition::default(),
            switch_generation: 0,
            mark_swap: false,
        });
        wait_for(|| queue.is_finished()).await;

        let (units, _, eos) = drain(&queue);
        assert!(eos);
        assert_eq!(units.len(), 20);
        assert_eq!(memory.request_count(&segment), 4);
        handle.stop().await;
    }

    #[tokio::test]
    async fn refused_open_fails_after_the_open_timeout() {
        let memory = MemoryFetcher::new();
        let url = serve_playlist(&memory, "memory://cdn/down/", 0, 1, 20, true);
        let segment = Url::parse("memory://cdn/down/seg0.ts").unwrap();
        memory.refuse(&segment, u32::MAX);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let context = context_with(&memory, patient_opens);
        let started = std::time::Instant::now();
        let handle = FetcherHandle::spawn(13, url, &context, events_tx, &CancellationToken::new());
        let (queue, sinks) = audio_sink();
        handle.start(StartRequest {
            sinks,
            position: StartPosition::default(),
            switch_generation: 0,
            mark_swap: false,
        });
        wait_for(|| queue.is_finished()).await;

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(memory.request_count(&segment) >= 5);
        assert!(matches!(queue.dequeue(), Dequeued::Error(IngestError::CannotConnect { .. })));
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(
                event,
                FetcherEvent::Error { id: 13, error: IngestError::CannotConnect { .. } }
            );
        }
        assert!(saw_error);
        handle.stop().await;
    }
}
