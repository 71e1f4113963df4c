//! Cumulative per-day block index.

use super::body::PageBodyBlock;
use super::INDEX_COUNT;
use crate::candle::SECONDS_PER_DAY;
use std::ops::Range;

/// `index[d]` is the number of blocks whose day-of-year is below `d`, so
/// the blocks of day `d` are `body[index[d]..index[d + 1]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageIndex(Vec<u32>);

/// Day slot of a block offset.
pub fn day_of(offset: u32) -> usize {
    (i64::from(offset) / SECONDS_PER_DAY) as usize
}

impl PageIndex {
    pub fn new() -> Self {
        Self(vec![0; INDEX_COUNT])
    }

    pub fn from_buckets(buckets: Vec<u32>) -> Self {
        Self(buckets)
    }

    /// Builds an index from scratch for a sorted body.
    pub fn from_blocks(blocks: &[PageBodyBlock]) -> Self {
        let mut index = Self::new();
        index.apply_daily_counts(&daily_counts(blocks));
        index
    }

    /// Adds per-day counts to the cumulative buckets.
    pub fn apply_daily_counts(&mut self, daily: &[u32]) {
        let mut cumulative = 0u32;
        for i in 1..INDEX_COUNT {
            cumulative += daily.get(i - 1).copied().unwrap_or(0);
            self.0[i] += cumulative;
        }
    }

    /// Body positions holding the blocks of `day`.
    pub fn day_range(&self, day: usize) -> Range<usize> {
        if day + 1 >= INDEX_COUNT {
            let last = self.0[INDEX_COUNT - 1] as usize;
            return last..last;
        }
        self.0[day] as usize..self.0[day + 1] as usize
    }

    pub fn buckets(&self) -> &[u32] {
        &self.0
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Block count per day slot.
pub fn daily_counts(blocks: &[PageBodyBlock]) -> Vec<u32> {
    let mut daily = vec![0u32; INDEX_COUNT];
    for block in blocks {
        daily[day_of(block.offset)] += 1;
    }
    daily
}
