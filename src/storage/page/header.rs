//! Page header: fixed fields plus the day index.

use super::index::PageIndex;
use super::{
    HEADER_SIZE, INDEX_COUNT, MAGIC, MAX_CODE_LENGTH, MAX_MARKET_CODE_LENGTH, PAGE_VERSION,
};
use crate::candle::{start_of_year, CandleSet};
use crate::storage::error::{StorageError, StorageResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    /// Highest transaction id applied to this page.
    pub last_tx_id: u64,
    pub market_code: String,
    pub code: String,
    pub year: u16,
    pub candle_length: u32,
    /// Always equals the body length.
    pub count: u32,
    pub start_offset: u32,
    pub end_offset: u32,
    pub index: PageIndex,
}

impl PageHeader {
    pub fn new(set: &CandleSet) -> Self {
        Self {
            last_tx_id: 0,
            market_code: set.market_code.clone(),
            code: set.code.clone(),
            year: set.year,
            candle_length: set.candle_length,
            count: 0,
            start_offset: 0,
            end_offset: 0,
            index: PageIndex::new(),
        }
    }

    pub fn candle_set(&self) -> CandleSet {
        CandleSet::new(
            self.market_code.clone(),
            self.code.clone(),
            self.candle_length,
            self.year,
        )
    }

    /// Unix timestamp of the first block.
    pub fn first_timestamp(&self) -> i64 {
        start_of_year(i32::from(self.year)) + i64::from(self.start_offset)
    }

    /// Unix timestamp of the last block.
    pub fn last_timestamp(&self) -> i64 {
        start_of_year(i32::from(self.year)) + i64::from(self.end_offset)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        let mut fixed = [0u8; HEADER_SIZE];
        reader.read_exact(&mut fixed)?;
        if fixed[0..4] != MAGIC {
            return Err(StorageError::InvalidMagic);
        }
        let mut cursor = &fixed[4..32];
        let version = cursor.read_u16::<LittleEndian>()?;
        if version != PAGE_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }
        let year = cursor.read_u16::<LittleEndian>()?;
        let candle_length = cursor.read_u32::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()?;
        let start_offset = cursor.read_u32::<LittleEndian>()?;
        let end_offset = cursor.read_u32::<LittleEndian>()?;
        let last_tx_id = cursor.read_u64::<LittleEndian>()?;
        let market_code = read_padded("market code", &fixed[32..42])?;
        let code = read_padded("code", &fixed[42..60])?;

        let mut buckets = vec![0u32; INDEX_COUNT];
        reader.read_u32_into::<LittleEndian>(&mut buckets)?;

        Ok(Self {
            last_tx_id,
            market_code,
            code,
            year,
            candle_length,
            count,
            start_offset,
            end_offset,
            index: PageIndex::from_buckets(buckets),
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> StorageResult<()> {
        writer.write_all(&MAGIC)?;
        writer.write_u16::<LittleEndian>(PAGE_VERSION)?;
        writer.write_u16::<LittleEndian>(self.year)?;
        writer.write_u32::<LittleEndian>(self.candle_length)?;
        writer.write_u32::<LittleEndian>(self.count)?;
        writer.write_u32::<LittleEndian>(self.start_offset)?;
        writer.write_u32::<LittleEndian>(self.end_offset)?;
        writer.write_u64::<LittleEndian>(self.last_tx_id)?;
        write_padded(writer, "market code", &self.market_code, MAX_MARKET_CODE_LENGTH)?;
        write_padded(writer, "code", &self.code, MAX_CODE_LENGTH)?;
        for i in 0..INDEX_COUNT {
            let bucket = self.index.buckets().get(i).copied().unwrap_or(self.count);
            writer.write_u32::<LittleEndian>(bucket)?;
        }
        Ok(())
    }
}

fn read_padded(field: &str, bytes: &[u8]) -> StorageResult<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| StorageError::CorruptedPage(format!("{} is not valid UTF-8", field)))
}

/// Writes `value` NUL-padded to exactly `width` bytes.
pub(crate) fn write_padded<W: Write>(
    writer: &mut W,
    field: &'static str,
    value: &str,
    width: usize,
) -> StorageResult<()> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(StorageError::FieldTooLong {
            field,
            max: width,
            actual: bytes.len(),
        });
    }
    writer.write_all(bytes)?;
    writer.write_all(&vec![0u8; width - bytes.len()])?;
    Ok(())
}
