//! Notifications delivered to the session owner.

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::IngestError;
use crate::stream::StreamMask;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Every active stream buffered enough to start playback.
    Prepared,
    /// Connecting failed. Emitted at most once per session.
    PreparationFailed(IngestError),
    /// The URL does not point at HLS content.
    SourceUnsupported,
    StreamsChanged {
        mask: StreamMask,
    },
    DurationUpdate(i64),
    BufferingStart,
    BufferingEnd,
    /// Timed ID3 metadata was found in the stream.
    MetadataDetected,
    BandwidthSwitched {
        index: usize,
        bandwidth: u64,
    },
    Error(IngestError),
}

/// Stream of [`SessionEvent`]s handed out when a session is created.
pub type SessionEvents = UnboundedReceiverStream<SessionEvent>;

/// Sending half shared by the controller and the consumer side.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, SessionEvents) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, UnboundedReceiverStream::new(receiver))
    }

    pub fn emit(&self, event: SessionEvent) {
        tracing::trace!(?event, "Session event");
        // The owner may have dropped the stream; events are advisory.
        let _ = self.sender.send(event);
    }
}
