//! Fixed-width body blocks.

use super::BLOCK_WIDTH;
use crate::candle::{start_of_year, TimestampCandle};
use crate::storage::error::StorageResult;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// One candle inside a page: offset from the start of the page's year,
/// big-endian bitfield and five little-endian floats.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PageBodyBlock {
    /// Seconds since the start of the page's year.
    pub offset: u32,
    pub bit_fields: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PageBodyBlock {
    /// Builds a block for a candle already known to be inside `year`.
    pub fn from_candle(year: u16, candle: &TimestampCandle) -> Self {
        Self {
            offset: (candle.timestamp - start_of_year(i32::from(year))) as u32,
            bit_fields: candle.bit_fields,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }

    pub fn to_candle(&self, year: u16) -> TimestampCandle {
        TimestampCandle {
            timestamp: start_of_year(i32::from(year)) + i64::from(self.offset),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            bit_fields: self.bit_fields,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        let mut bytes = [0u8; BLOCK_WIDTH];
        reader.read_exact(&mut bytes)?;
        let mut cursor = &bytes[..];
        Ok(Self {
            offset: cursor.read_u32::<LittleEndian>()?,
            bit_fields: cursor.read_u32::<BigEndian>()?,
            open: cursor.read_f64::<LittleEndian>()?,
            high: cursor.read_f64::<LittleEndian>()?,
            low: cursor.read_f64::<LittleEndian>()?,
            close: cursor.read_f64::<LittleEndian>()?,
            volume: cursor.read_f64::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> StorageResult<()> {
        writer.write_u32::<LittleEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.bit_fields)?;
        writer.write_f64::<LittleEndian>(self.open)?;
        writer.write_f64::<LittleEndian>(self.high)?;
        writer.write_f64::<LittleEndian>(self.low)?;
        writer.write_f64::<LittleEndian>(self.close)?;
        writer.write_f64::<LittleEndian>(self.volume)?;
        Ok(())
    }
}
