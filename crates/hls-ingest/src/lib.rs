//! Adaptive HLS ingestion.
//!
//! Turns a master playlist URL into time-ordered access units per stream
//! type. A [`LiveSession`] drives one [`fetcher`] actor per media playlist,
//! switches variants as the bandwidth estimate moves and hands units out
//! through [`LiveSession::dequeue_access_unit`].
//!
//! ```no_run
//! use hls_ingest::{IngestConfig, LiveSession, StreamType, queue::Dequeued};
//!
//! # async fn run() -> hls_ingest::Result<()> {
//! let (session, _events) = LiveSession::with_http(IngestConfig::default())?;
//! session.connect("https://example.com/master.m3u8").await?;
//! loop {
//!     match session.dequeue_access_unit(StreamType::Video) {
//!         Dequeued::Unit(unit) => println!("{} bytes at {}us", unit.data.len(), unit.timestamp_us),
//!         Dequeued::EndOfStream | Dequeued::Error(_) => break,
//!         _ => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod config;
pub mod decryption;
pub mod error;
pub mod fetcher;
pub mod format;
pub mod id3;
pub mod net;
pub mod playlist;
pub mod queue;
pub mod reassembler;
pub mod session;
pub mod stream;
pub mod ts_demux;

pub use config::IngestConfig;
pub use error::{ErrorCategory, FailurePoint, IngestError, Result};
pub use format::MediaFormat;
pub use queue::{AccessUnit, Dequeued, Discontinuity, DiscontinuityKind, PacketQueue};
pub use session::{LiveSession, SessionEvent, SessionEvents};
pub use stream::{StreamMask, StreamType};
