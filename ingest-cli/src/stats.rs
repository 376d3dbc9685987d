//! Per-stream counters printed when ingestion ends.

use std::fmt;

use hls_ingest::{AccessUnit, Discontinuity, StreamType};

#[derive(Debug, Default)]
pub struct StreamStats {
    pub units: u64,
    pub bytes: u64,
    pub sync_units: u64,
    pub discontinuities: u64,
    pub swaps: u64,
    pub first_us: Option<i64>,
    pub last_us: Option<i64>,
    /// Times the presentation clock went backwards.
    pub regressions: u64,
    pub finished: bool,
}

impl StreamStats {
    pub fn record_unit(&mut self, unit: &AccessUnit) {
        if self.last_us.is_some_and(|last| unit.timestamp_us < last) {
            self.regressions += 1;
        }
        self.units += 1;
        self.bytes += unit.data.len() as u64;
        if unit.is_sync {
            self.sync_units += 1;
        }
        self.first_us.get_or_insert(unit.timestamp_us);
        self.last_us = Some(unit.timestamp_us);
    }

    pub fn record_discontinuity(&mut self, discontinuity: &Discontinuity) {
        self.discontinuities += 1;
        if discontinuity.swap {
            self.swaps += 1;
        }
    }

    pub fn span_us(&self) -> i64 {
        match (self.first_us, self.last_us) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }
}

/// Summary line for one stream.
pub struct Report<'a> {
    pub stream: StreamType,
    pub stats: &'a StreamStats,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.stats;
        write!(
            f,
            "{:<9} units={:<7} bytes={:<10} sync={:<6} span={:.3}s discontinuities={} swaps={}",
            self.stream,
            s.units,
            s.bytes,
            s.sync_units,
            s.span_us() as f64 / 1_000_000.0,
            s.discontinuities,
            s.swaps,
        )?;
        if s.regressions > 0 {
            write!(f, " regressions={}", s.regressions)?;
        }
        if !s.finished {
            write!(f, " (unfinished)")?;
        }
        Ok(())
    }
}
