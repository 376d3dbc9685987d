//! Stream builders and polling helpers shared by the session tests.

#![allow(dead_code)]

use std::time::Duration;

use cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use futures::StreamExt;
use hls_ingest::net::MemoryFetcher;
use hls_ingest::{
    AccessUnit, Dequeued, Discontinuity, IngestConfig, LiveSession, SessionEvent, SessionEvents, StreamType,
};
use url::Url;

/// 1024 samples at 48 kHz in 90 kHz ticks.
pub const AAC_FRAME_TICKS: u64 = 1920;
pub const FIRST_PTS: u64 = 900_000;

const TS_PACKET_SIZE: usize = 188;
const AUDIO_PID: u16 = 0x101;
const PMT_PID: u16 = 0x100;

pub fn adts_frame(payload: &[u8]) -> Vec<u8> {
    // AAC LC, 48 kHz, stereo, no CRC.
    let (sampling_index, channels) = (3u8, 2u8);
    let len = payload.len() + 7;
    let mut frame = vec![
        0xFF,
        0xF1,
        (1 << 6) | (sampling_index << 2) | (channels >> 2),
        ((channels & 0x03) << 6) | ((len >> 11) as u8 & 0x03),
        (len >> 3) as u8,
        (((len & 0x07) as u8) << 5) | 0x1F,
        0xFC,
    ];
    frame.extend_from_slice(payload);
    frame
}

fn packetize(pid: u16, data: &[u8], cc: &mut u8) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, chunk) in data.chunks(184).enumerate() {
        let start = if i == 0 { 0x40 } else { 0x00 };
        let mut packet = vec![0x47, start | (pid >> 8) as u8 & 0x1F, pid as u8];
        if chunk.len() < 184 {
            let af_len = 183 - chunk.len();
            packet.push(0x30 | (*cc & 0x0F));
            packet.push(af_len as u8);
            if af_len > 0 {
                packet.push(0x00);
                packet.extend(std::iter::repeat_n(0xFF, af_len - 1));
            }
        } else {
            packet.push(0x10 | (*cc & 0x0F));
        }
        packet.extend_from_slice(chunk);
        assert_eq!(packet.len(), TS_PACKET_SIZE);
        out.extend(packet);
        *cc = cc.wrapping_add(1);
    }
    out
}

fn pat() -> Vec<u8> {
    let mut section = vec![0x00, 0x00, 0xB0, 13, 0x00, 0x01, 0xC1, 0x00, 0x00];
    section.extend([0x00, 0x01, 0xE0 | (PMT_PID >> 8) as u8, PMT_PID as u8]);
    section.extend([0; 4]);
    packetize(0, &section, &mut 0)
}

fn pmt() -> Vec<u8> {
    let mut section = vec![0x00, 0x02, 0xB0, 18, 0x00, 0x01, 0xC1, 0x00, 0x00];
    section.extend([0xE1, 0x00, 0xF0, 0x00]);
    section.extend([0x0F, 0xE0 | (AUDIO_PID >> 8) as u8, AUDIO_PID as u8, 0xF0, 0x00]);
    section.extend([0; 4]);
    packetize(PMT_PID, &section, &mut 0)
}

fn pes(pts: u64, payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut out = vec![0x00, 0x00, 0x01, 0xC0, (len >> 8) as u8, len as u8];
    out.extend([0x80, 0x80, 0x05]);
    out.extend([
        0x21 | ((pts >> 29) & 0x0E) as u8,
        (pts >> 22) as u8,
        (((pts >> 14) & 0xFE) | 1) as u8,
        (pts >> 7) as u8,
        (((pts << 1) & 0xFE) | 1) as u8,
    ]);
    out.extend_from_slice(payload);
    out
}

/// Audio-only TS segment of `frames` ADTS frames filled with `fill`.
pub fn ts_segment(first_pts: u64, frames: usize, fill: u8) -> Vec<u8> {
    let mut data = pat();
    data.extend(pmt());
    let mut cc = 0;
    for i in 0..frames {
        let pts = first_pts + i as u64 * AAC_FRAME_TICKS;
        data.extend(packetize(AUDIO_PID, &pes(pts, &adts_frame(&[fill; 16])), &mut cc));
    }
    data
}

pub fn segment_pts(seq: u64, frames: usize) -> u64 {
    FIRST_PTS + seq * frames as u64 * AAC_FRAME_TICKS
}

/// Media playlist layout served by [`serve_media`].
#[derive(Debug, Clone)]
pub struct MediaLayout {
    pub first_seq: u64,
    pub count: usize,
    pub frames: usize,
    pub complete: bool,
    pub fill: u8,
    /// AES-128 key; segments are encrypted with the sequence number IV.
    pub key: Option<[u8; 16]>,
}

impl Default for MediaLayout {
    fn default() -> Self {
        Self {
            first_seq: 0,
            count: 5,
            frames: 20,
            complete: true,
            fill: 0x11,
            key: None,
        }
    }
}

pub fn encrypt(data: &[u8], key: &[u8; 16], seq: u64) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&seq.to_be_bytes());
    cbc::Encryptor::<aes::Aes128>::new_from_slices(key, &iv)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(data)
}

/// Register a media playlist and its segments under `base`.
pub fn serve_media(fetcher: &MemoryFetcher, base: &str, layout: &MediaLayout) -> Url {
    let duration = layout.frames as f64 * AAC_FRAME_TICKS as f64 / 90_000.0;
    let mut text = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:{}\n",
        duration.ceil() as u64,
        layout.first_seq
    );
    if let Some(key) = &layout.key {
        let key_url = Url::parse(&format!("{base}key.bin")).unwrap();
        fetcher.insert(&key_url, key.to_vec());
        text.push_str("#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n");
    }
    for i in 0..layout.count {
        let seq = layout.first_seq + i as u64;
        let uri = Url::parse(&format!("{base}seg{seq}.ts")).unwrap();
        let segment = ts_segment(segment_pts(seq, layout.frames), layout.frames, layout.fill);
        match &layout.key {
            Some(key) => fetcher.insert(&uri, encrypt(&segment, key, seq)),
            None => fetcher.insert(&uri, segment),
        }
        text.push_str(&format!("#EXTINF:{duration:.3},\nseg{seq}.ts\n"));
    }
    if layout.complete {
        text.push_str("#EXT-X-ENDLIST\n");
    }
    let url = Url::parse(&format!("{base}index.m3u8")).unwrap();
    fetcher.insert(&url, text.into_bytes());
    url
}

pub fn serve_text(fetcher: &MemoryFetcher, url: &str, text: &str) -> Url {
    let url = Url::parse(url).unwrap();
    fetcher.insert(&url, text.as_bytes().to_vec());
    url
}

pub fn test_config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.fetcher.max_monitor_delay = Duration::from_millis(20);
    config.fetcher.segment_retry.max_retries = 1;
    config.fetcher.segment_retry.base_delay = Duration::from_millis(1);
    config.playlist.retry.max_retries = 0;
    config.bandwidth.poll_interval = Duration::from_millis(20);
    config.bandwidth.up_switch_min_buffer = Duration::ZERO;
    config
}

pub fn session(fetcher: &MemoryFetcher, config: IngestConfig) -> (LiveSession, SessionEvents) {
    LiveSession::new(config, std::sync::Arc::new(fetcher.clone()))
}

/// Next event matching `predicate`, skipping the others.
pub async fn wait_for_event<F>(events: &mut SessionEvents, predicate: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.next().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Everything a stream yielded up to its terminal result.
#[derive(Debug)]
pub struct Drained {
    pub units: Vec<AccessUnit>,
    /// Markers with the number of units dequeued before each.
    pub markers: Vec<(usize, Discontinuity)>,
    pub end: Dequeued,
}

impl Drained {
    pub fn timestamps(&self) -> Vec<i64> {
        self.units.iter().map(|u| u.timestamp_us).collect()
    }
}

pub async fn drain(session: &LiveSession, stream: StreamType) -> Drained {
    tokio::time::timeout(Duration::from_secs(20), async {
        let mut units = Vec::new();
        let mut markers = Vec::new();
        loop {
            match session.dequeue_access_unit(stream) {
                Dequeued::Unit(unit) => units.push(unit),
                Dequeued::Discontinuity(d) => markers.push((units.len(), d)),
                Dequeued::WouldBlock => tokio::time::sleep(Duration::from_millis(2)).await,
                end => return Drained { units, markers, end },
            }
        }
    })
    .await
    .expect("timed out draining stream")
}

/// Consecutive presentation times advance by exactly one AAC frame.
pub fn assert_contiguous(timestamps: &[i64]) {
    for pair in timestamps.windows(2) {
        let step = pair[1] - pair[0];
        assert!(
            (21_333..=21_334).contains(&step),
            "gap or overlap between {} and {}",
            pair[0],
            pair[1]
        );
    }
}
