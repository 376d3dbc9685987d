//! Bandwidth estimation and variant selection.
//!
//! Fetchers report one sample per downloaded segment (or per partial
//! segment when a download fails). The controller turns the window of
//! samples into a bits-per-second estimate and picks the variant to fetch.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::BandwidthConfig;
use crate::playlist::VariantTable;

/// Number of most recent samples used for the short-term estimate.
const SHORT_TERM_SAMPLES: usize = 3;
/// Short-term and long-term estimates within this ratio count as stable.
const STABLE_RATIO: f64 = 0.3;

/// One completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    pub bytes: u64,
    pub duration: Duration,
    pub at: Instant,
}

/// Estimate produced from the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthEstimate {
    /// Total bits over total transfer time, in bits per second.
    pub bps: u64,
    /// Same computation over the last few samples only.
    pub short_term_bps: u64,
    /// Whether the short-term estimate agrees with the long-term one.
    pub is_stable: bool,
}

/// Sliding window throughput estimator.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    samples: VecDeque<BandwidthSample>,
    window_size: usize,
    max_age: Duration,
}

impl BandwidthEstimator {
    pub fn new(config: &BandwidthConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window_size),
            window_size: config.window_size.max(1),
            max_age: config.max_sample_age,
        }
    }

    pub fn add_sample(&mut self, bytes: u64, duration: Duration) {
        self.add_sample_at(bytes, duration, Instant::now());
    }

    pub fn add_sample_at(&mut self, bytes: u64, duration: Duration, at: Instant) {
        if duration.is_zero() {
            return;
        }
        if self.samples.len() == self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(BandwidthSample {
            bytes,
            duration,
            at,
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Drop samples older than the configured age, then estimate.
    pub fn estimate(&mut self) -> Option<BandwidthEstimate> {
        self.estimate_at(Instant::now())
    }

    pub fn estimate_at(&mut self, now: Instant) -> Option<BandwidthEstimate> {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > self.max_age {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        if self.samples.is_empty() {
            return None;
        }

        let bps = bits_per_second(self.samples.iter());
        let skip = self.samples.len().saturating_sub(SHORT_TERM_SAMPLES);
        let short_term_bps = bits_per_second(self.samples.iter().skip(skip));
        let is_stable = self.samples.len() >= SHORT_TERM_SAMPLES
            && (short_term_bps as f64 - bps as f64).abs() <= bps as f64 * STABLE_RATIO;

        Some(BandwidthEstimate {
            bps,
            short_term_bps,
            is_stable,
        })
    }
}

fn bits_per_second<'a>(samples: impl Iterator<Item = &'a BandwidthSample>) -> u64 {
    let (bytes, time) = samples.fold((0u64, Duration::ZERO), |(bytes, time), s| {
        (bytes + s.bytes, time + s.duration)
    });
    let secs = time.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (bytes as f64 * 8.0 / secs) as u64
}

/// Highest variant whose scaled bitrate fits the estimate.
///
/// Every candidate must fit with its bitrate scaled by
/// `down_switch_factor`. Candidates above `current` must also fit when
/// scaled by `up_switch_factor`, so a variant reached by an upward move
/// always passes the rule for staying on it and the selection settles
/// instead of bouncing. Upward moves are additionally gated by
/// [`can_switch_up`]. Falls back to the lowest variant.
pub fn select_bandwidth_index(
    table: &VariantTable,
    estimate_bps: u64,
    current: usize,
    config: &BandwidthConfig,
) -> usize {
    if table.len() <= 1 {
        return 0;
    }
    let fits = |index: usize, factor: f64| table.bandwidth(index) as f64 * factor <= estimate_bps as f64;
    (0..table.len())
        .rev()
        .find(|&index| {
            fits(index, config.down_switch_factor)
                && (index <= current || fits(index, config.up_switch_factor))
        })
        .unwrap_or(0)
}

/// Whether an upward switch is allowed right now.
pub fn can_switch_up(
    buffered: Duration,
    estimate_bps: u64,
    current_bps: u64,
    config: &BandwidthConfig,
) -> bool {
    buffered >= config.up_switch_min_buffer
        && estimate_bps as f64 > current_bps as f64 * config.up_switch_headroom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::Variant;
    use crate::stream::StreamMask;
    use proptest::prelude::*;
    use url::Url;

    fn table(bandwidths: &[u64]) -> VariantTable {
        let variants = bandwidths
            .iter()
            .enumerate()
            .map(|(i, bw)| Variant {
                listed_index: i,
                uri: Url::parse(&format!("http://h/{i}.m3u8")).unwrap(),
                bandwidth: *bw,
                codecs: None,
                resolution: None,
                audio_group: None,
                subtitle_group: None,
                stream_mask: StreamMask::AUDIO | StreamMask::VIDEO,
            })
            .collect();
        VariantTable::from_variants(variants)
    }

    #[test]
    fn picks_high_variant_from_either_side() {
        let cfg = BandwidthConfig::default();
        let t = table(&[400_000, 2_000_000]);
        assert_eq!(select_bandwidth_index(&t, 2_200_000, 1, &cfg), 1);
        assert_eq!(select_bandwidth_index(&t, 2_200_000, 0, &cfg), 1);
    }

    #[test]
    fn steady_estimate_does_not_flip_variants() {
        let cfg = BandwidthConfig::default();
        let t = table(&[400_000, 2_000_000]);
        // 1.5 Mbps: 0.8 * 2 Mbps = 1.6 Mbps does not fit, from either side.
        assert_eq!(select_bandwidth_index(&t, 1_500_000, 1, &cfg), 0);
        assert_eq!(select_bandwidth_index(&t, 1_500_000, 0, &cfg), 0);
        assert_eq!(select_bandwidth_index(&t, 100_000, 1, &cfg), 0);

        let mut current = 0;
        for _ in 0..4 {
            current = select_bandwidth_index(&t, 1_700_000, current, &cfg);
        }
        assert_eq!(current, 1);
        assert_eq!(select_bandwidth_index(&t, 1_700_000, current, &cfg), 1);
    }

    #[test]
    fn up_factor_is_the_stricter_one_when_configured_so() {
        let cfg = BandwidthConfig {
            up_switch_factor: 0.9,
            down_switch_factor: 0.8,
            ..Default::default()
        };
        let t = table(&[400_000, 2_000_000]);
        // Fits to stay (1.6 Mbps) but not to move up (1.8 Mbps).
        assert_eq!(select_bandwidth_index(&t, 1_700_000, 0, &cfg), 0);
        assert_eq!(select_bandwidth_index(&t, 1_700_000, 1, &cfg), 1);
    }

    #[test]
    fn up_switch_gate() {
        let cfg = BandwidthConfig::default();
        assert!(!can_switch_up(Duration::from_secs(5), 5_000_000, 400_000, &cfg));
        assert!(can_switch_up(Duration::from_secs(10), 5_000_000, 400_000, &cfg));
        assert!(!can_switch_up(Duration::from_secs(12), 450_000, 400_000, &cfg));
    }

    #[test]
    fn estimator_windows_and_ages_samples() {
        let cfg = BandwidthConfig {
            window_size: 3,
            max_sample_age: Duration::from_secs(10),
            ..Default::default()
        };
        let mut est = BandwidthEstimator::new(&cfg);
        let t0 = Instant::now();
        est.add_sample_at(125_000, Duration::from_secs(1), t0);
        est.add_sample_at(125_000, Duration::from_secs(1), t0);
        est.add_sample_at(250_000, Duration::from_secs(1), t0);
        est.add_sample_at(250_000, Duration::from_secs(1), t0 + Duration::from_secs(5));
        assert_eq!(est.len(), 3);

        let e = est.estimate_at(t0 + Duration::from_secs(6)).unwrap();
        // (125k + 250k + 250k) bytes over 3 s.
        assert_eq!(e.bps, 1_666_666);
        assert!(e.is_stable);

        let e = est.estimate_at(t0 + Duration::from_secs(12)).unwrap();
        assert_eq!(est.len(), 1);
        assert_eq!(e.bps, 2_000_000);
        assert!(!e.is_stable);

        assert!(est.estimate_at(t0 + Duration::from_secs(30)).is_none());
    }

    proptest! {
        #[test]
        fn selection_is_idempotent(
            mut bandwidths in proptest::collection::vec(1u64..20_000_000, 1..8),
            estimate in 0u64..40_000_000,
            current_seed in 0usize..8,
        ) {
            bandwidths.sort_unstable();
            let t = table(&bandwidths);
            let cfg = BandwidthConfig::default();
            let current = current_seed % t.len();
            let first = select_bandwidth_index(&t, estimate, current, &cfg);
            let second = select_bandwidth_index(&t, estimate, current, &cfg);
            prop_assert_eq!(first, second);
            prop_assert!(first < t.len());
            // Once there, the same estimate keeps it there.
            prop_assert_eq!(select_bandwidth_index(&t, estimate, first, &cfg), first);
        }
    }
}
