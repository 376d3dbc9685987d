use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::net::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client options shared by playlist, key and segment requests.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// User agent string
    pub user_agent: String,
    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,
    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,
    /// Whether to follow redirects
    pub follow_redirects: bool,
    /// Extra headers sent with every request
    pub headers: HeaderMap,
    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            headers: HttpConfig::get_default_headers(),
            pool_max_idle_per_host: 10,
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers
    }
}

/// Segment fetcher pacing, download and retry behaviour.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Bytes handed to decryption/demux per step. Must be a multiple of 16
    /// (AES block) and 188 (TS packet).
    pub download_block_size: usize,
    /// Upper bound on how much a fetcher buffers ahead.
    pub min_buffered_duration: Duration,
    /// Buffer target in units of the playlist target duration.
    pub target_duration_multiplier: u32,
    /// Longest idle wait between monitor passes once prepared.
    pub max_monitor_delay: Duration,
    /// How long failures to open a segment are retried before they are fatal.
    pub open_failure_timeout: Duration,
    /// Time budget for recovering from a sequence number that rolled out of
    /// the live window. Zero ends the stream on the first miss.
    pub missed_boat_budget: Duration,
    /// Live playlists start this many segments before the live edge.
    pub live_start_offset: u64,
    /// Backoff between whole-segment retries.
    pub segment_retry: RetryPolicy,
    /// Retry policy for key downloads.
    pub key_retry: RetryPolicy,
    /// Timeout for a single key request.
    pub key_download_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            download_block_size: 47 * 1024,
            min_buffered_duration: Duration::from_secs(10),
            target_duration_multiplier: 3,
            max_monitor_delay: Duration::from_secs(1),
            open_failure_timeout: Duration::from_secs(15),
            missed_boat_budget: Duration::from_secs(30),
            live_start_offset: 3,
            segment_retry: RetryPolicy {
                max_retries: u32::MAX,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(4),
                jitter: true,
            },
            key_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                jitter: true,
            },
            key_download_timeout: Duration::from_secs(5),
        }
    }
}

/// Bandwidth estimation and variant switching thresholds.
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// Scale applied to the bitrate of a higher variant before comparing it
    /// with the estimate.
    pub up_switch_factor: f64,
    /// Scale applied to the bitrate of the current or a lower variant.
    pub down_switch_factor: f64,
    /// Buffer that must already exist on some stream before switching up.
    pub up_switch_min_buffer: Duration,
    /// Estimate must exceed the current bitrate by this ratio to switch up.
    pub up_switch_headroom: f64,
    /// Number of samples kept by the estimator.
    pub window_size: usize,
    /// Samples older than this are discarded.
    pub max_sample_age: Duration,
    /// How often the controller re-evaluates the variant.
    pub poll_interval: Duration,
    /// Disable automatic switching and stay on the initial variant.
    pub adaptive: bool,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            up_switch_factor: 0.7,
            down_switch_factor: 0.8,
            up_switch_min_buffer: Duration::from_secs(10),
            up_switch_headroom: 1.2,
            window_size: 10,
            max_sample_age: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            adaptive: true,
        }
    }
}

/// Consumer-side buffering hysteresis.
#[derive(Debug, Clone)]
pub struct BufferingConfig {
    /// A stream leaves the buffering state once this much is queued (capped
    /// by the target duration hint of the queued units).
    pub resume_threshold: Duration,
    /// Buffered duration on every active stream before the session reports
    /// itself prepared.
    pub prepare_threshold: Duration,
    /// Video may not run further ahead of a starving audio stream than this.
    pub twin_stream_max_lead: Duration,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            resume_threshold: Duration::from_secs(10),
            prepare_threshold: Duration::from_secs(2),
            twin_stream_max_lead: Duration::from_secs(2),
        }
    }
}

/// Playlist download behaviour.
#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    /// Timeout for fetching a single playlist.
    pub fetch_timeout: Duration,
    /// Consecutive refresh failures tolerated before the fetcher gives up.
    pub max_refresh_failures: u32,
    /// Retry policy for the initial master playlist request.
    pub retry: RetryPolicy,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            max_refresh_failures: 5,
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                jitter: true,
            },
        }
    }
}

/// Aggregated configuration for an ingest session.
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub http: HttpConfig,
    pub fetcher: FetcherConfig,
    pub bandwidth: BandwidthConfig,
    pub buffering: BufferingConfig,
    pub playlist: PlaylistConfig,
}

impl IngestConfig {
    /// Buffer target for a playlist: `multiplier * target_duration`, capped.
    pub fn buffer_target(&self, target_duration: Duration) -> Duration {
        let target = target_duration * self.fetcher.target_duration_multiplier;
        if target.is_zero() {
            return self.fetcher.min_buffered_duration;
        }
        target.min(self.fetcher.min_buffered_duration)
    }
}
