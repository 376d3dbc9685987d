use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeInfo {
    len: usize,
    timestamp_us: i64,
    /// Units already cut from the front of this record.
    units_taken: u32,
}

/// FIFO of `(byte length, timestamp)` records, one per append.
///
/// Maps bytes leaving the reassembly buffer back to the timestamp of the
/// append that contributed them.
#[derive(Debug, Clone, Default)]
pub struct RangeQueue {
    ranges: VecDeque<RangeInfo>,
}

impl RangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, len: usize, timestamp_us: i64) {
        if len == 0 {
            return;
        }
        self.ranges.push_back(RangeInfo {
            len,
            timestamp_us,
            units_taken: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn total_len(&self) -> usize {
        self.ranges.iter().map(|r| r.len).sum()
    }

    /// Remaining length of the oldest record.
    pub fn front_len(&self) -> Option<usize> {
        self.ranges.front().map(|r| r.len)
    }

    /// Consume `n` bytes and return the timestamp of the record holding the
    /// first of them.
    pub fn fetch_timestamp(&mut self, n: usize) -> Option<i64> {
        self.fetch_timestamp_indexed(n).map(|(ts, _)| ts)
    }

    /// Like [`fetch_timestamp`](Self::fetch_timestamp), also returning how
    /// many units were already cut from the front of that record. Lets
    /// fixed-duration audio frames inside one record be spaced out.
    pub fn fetch_timestamp_indexed(&mut self, mut n: usize) -> Option<(i64, u32)> {
        let first = *self.ranges.front()?;
        let result = (first.timestamp_us, first.units_taken);

        while n > 0 {
            let Some(front) = self.ranges.front_mut() else {
                break;
            };
            if front.len > n {
                front.len -= n;
                front.units_taken += 1;
                break;
            }
            n -= front.len;
            self.ranges.pop_front();
        }
        Some(result)
    }
}
