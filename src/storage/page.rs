//! Page format.
//!
//! A page holds every candle of one (market, code, candle length, year). On
//! disk it is a fixed 60-byte header, 372 little-endian `u32` day-index
//! buckets, then `count` 48-byte blocks sorted by offset.

pub mod body;
pub mod header;
pub mod index;

pub use body::PageBodyBlock;
pub use header::PageHeader;
pub use index::PageIndex;

use crate::candle::{CandleSet, TimestampCandle};
use crate::storage::error::{StorageError, StorageResult};
use index::{daily_counts, day_of};
use std::io::{Read, Write};

/// Size of one body block in bytes.
pub const BLOCK_WIDTH: usize = 48;
/// Rows of the day index; each row is one block wide.
pub const INDEX_ROW_COUNT: usize = 31;
/// Fixed header fields before the index.
pub const HEADER_SIZE: usize = 60;
/// Byte offset of the first body block.
pub const DATA_OFFSET: usize = BLOCK_WIDTH * INDEX_ROW_COUNT + HEADER_SIZE;
/// 31 rows x 12 columns of `u32`.
pub const INDEX_COUNT: usize = INDEX_ROW_COUNT * (BLOCK_WIDTH / 4);
pub const MAX_MARKET_CODE_LENGTH: usize = 10;
pub const MAX_CODE_LENGTH: usize = 18;
pub const MAGIC: [u8; 4] = [0x20, 0x18, 0x10, 0x29];
pub const PAGE_VERSION: u16 = 1;
/// Seconds in a leap year, the most blocks a 1s page can hold.
const MAX_YEAR_SECONDS: u64 = 366 * 86_400;
const PREALLOCATE_BLOCKS: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub header: PageHeader,
    pub body: Vec<PageBodyBlock>,
}

impl Page {
    /// Empty page for `set`.
    pub fn new(set: &CandleSet) -> Self {
        Self {
            header: PageHeader::new(set),
            body: Vec::new(),
        }
    }

    pub fn candle_set(&self) -> CandleSet {
        self.header.candle_set()
    }

    pub fn unique_key(&self) -> String {
        self.candle_set().unique_key()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn last_tx_id(&self) -> u64 {
        self.header.last_tx_id
    }

    /// Adds candles to the page.
    ///
    /// Input is sorted by timestamp; of several candles sharing a timestamp
    /// the last one wins. Candles strictly after the current last block are
    /// appended, anything else is merged and replaces existing blocks with
    /// the same offset.
    pub fn add(&mut self, candles: &[TimestampCandle]) -> StorageResult<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let set = self.candle_set();
        let mut sorted = candles.to_vec();
        sorted.sort_by_key(|candle| candle.timestamp);

        let mut blocks: Vec<PageBodyBlock> = Vec::with_capacity(sorted.len());
        for candle in &sorted {
            if !set.contains_timestamp(candle.timestamp) {
                return Err(StorageError::TimestampOutOfRange {
                    year: self.header.year,
                    timestamp: candle.timestamp,
                });
            }
            let block = PageBodyBlock::from_candle(self.header.year, candle);
            match blocks.last_mut() {
                Some(last) if last.offset == block.offset => *last = block,
                _ => blocks.push(block),
            }
        }

        if self.body.is_empty() || blocks[0].offset > self.header.end_offset {
            self.append(blocks);
        } else {
            self.merge(blocks);
        }
        Ok(())
    }

    fn append(&mut self, blocks: Vec<PageBodyBlock>) {
        if self.body.is_empty() {
            self.header.start_offset = blocks[0].offset;
        }
        self.header.end_offset = blocks[blocks.len() - 1].offset;
        self.header.count += blocks.len() as u32;
        self.header.index.apply_daily_counts(&daily_counts(&blocks));
        self.body.extend(blocks);
    }

    fn merge(&mut self, blocks: Vec<PageBodyBlock>) {
        let old = std::mem::take(&mut self.body);
        let mut merged = Vec::with_capacity(old.len() + blocks.len());
        let mut old_iter = old.into_iter().peekable();
        let mut new_iter = blocks.into_iter().peekable();

        loop {
            let heads = (
                old_iter.peek().map(|block| block.offset),
                new_iter.peek().map(|block| block.offset),
            );
            let next = match heads {
                (Some(old), Some(new)) if old < new => old_iter.next(),
                (Some(old), Some(new)) if old > new => new_iter.next(),
                (Some(_), Some(_)) => {
                    old_iter.next();
                    new_iter.next()
                }
                (Some(_), None) => old_iter.next(),
                (None, Some(_)) => new_iter.next(),
                (None, None) => break,
            };
            merged.extend(next);
        }

        self.header.start_offset = merged.first().map_or(0, |block| block.offset);
        self.header.end_offset = merged.last().map_or(0, |block| block.offset);
        self.header.count = merged.len() as u32;
        self.header.index = PageIndex::from_blocks(&merged);
        self.body = merged;
    }

    /// Blocks recorded on day `day` of the page's year (0-based).
    pub fn day_blocks(&self, day: usize) -> &[PageBodyBlock] {
        let range = self.header.index.day_range(day);
        self.body.get(range).unwrap_or(&[])
    }

    /// Blocks between two timestamps, inclusive.
    pub fn range(&self, from: i64, to: i64) -> &[PageBodyBlock] {
        let start = crate::candle::start_of_year(i32::from(self.header.year));
        let lower = (from - start).max(0);
        let upper = to - start;
        if upper < lower {
            return &[];
        }
        let from_day = day_of(lower.min(i64::from(u32::MAX)) as u32);
        let first = self.header.index.day_range(from_day).start.min(self.body.len());
        let tail = &self.body[first..];
        let begin = tail.partition_point(|block| i64::from(block.offset) < lower);
        let end = tail.partition_point(|block| i64::from(block.offset) <= upper);
        &tail[begin..end]
    }

    /// Body converted back to wire candles.
    pub fn candles(&self) -> Vec<TimestampCandle> {
        self.body
            .iter()
            .map(|block| block.to_candle(self.header.year))
            .collect()
    }

    pub fn read_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        let header = PageHeader::read_from(reader)?;
        let max_count = MAX_YEAR_SECONDS / u64::from(header.candle_length.max(1));
        if u64::from(header.count) > max_count {
            return Err(StorageError::CorruptedPage(format!(
                "count {} exceeds {} blocks of {}s in a year",
                header.count, max_count, header.candle_length
            )));
        }
        let indexed = header.index.buckets()[INDEX_COUNT - 1];
        if indexed != header.count {
            return Err(StorageError::CorruptedPage(format!(
                "header count {} does not match index total {}",
                header.count, indexed
            )));
        }
        // The count is checked but not yet backed by bytes; grow as blocks arrive.
        let mut body = Vec::with_capacity((header.count as usize).min(PREALLOCATE_BLOCKS));
        for _ in 0..header.count {
            body.push(PageBodyBlock::read_from(reader)?);
        }
        Ok(Self { header, body })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> StorageResult<()> {
        if self.header.count as usize != self.body.len() {
            return Err(StorageError::CorruptedPage(format!(
                "header count {} does not match body length {}",
                self.header.count,
                self.body.len()
            )));
        }
        self.header.write_to(writer)?;
        for block in &self.body {
            block.write_to(writer)?;
        }
        Ok(())
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        DATA_OFFSET + self.body.len() * BLOCK_WIDTH
    }
}
