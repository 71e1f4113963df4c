//! INSERT command: a batch of candles for one page.

use super::PageAccessor;
use crate::candle::{CandleSet, TimestampCandle};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{MAX_CODE_LENGTH, MAX_MARKET_CODE_LENGTH};
use bytes::{Buf, BufMut, BytesMut};

/// Fixed head: year, candle length, market code, code, candle count.
pub const INSERT_HEAD_SIZE: usize = 2 + 4 + MAX_MARKET_CODE_LENGTH + MAX_CODE_LENGTH + 4;
/// Encoded [`TimestampCandle`]: i64 timestamp, u32 bitfield, five f64s.
pub const TIMESTAMP_CANDLE_SIZE: usize = 8 + 4 + 8 * 5;

#[derive(Debug, Clone, PartialEq)]
pub struct InsertCommand {
    pub set: CandleSet,
    pub candles: Vec<TimestampCandle>,
}

impl InsertCommand {
    pub fn new(set: CandleSet, candles: Vec<TimestampCandle>) -> Self {
        Self { set, candles }
    }

    pub fn body_len(&self) -> usize {
        INSERT_HEAD_SIZE + self.candles.len() * TIMESTAMP_CANDLE_SIZE
    }

    pub fn encode(&self, buf: &mut BytesMut) -> StorageResult<()> {
        buf.reserve(self.body_len());
        buf.put_u16_le(self.set.year);
        buf.put_u32_le(self.set.candle_length);
        put_padded(buf, "market code", &self.set.market_code, MAX_MARKET_CODE_LENGTH)?;
        put_padded(buf, "code", &self.set.code, MAX_CODE_LENGTH)?;
        buf.put_u32_le(self.candles.len() as u32);
        for candle in &self.candles {
            buf.put_i64_le(candle.timestamp);
            buf.put_u32(candle.bit_fields);
            buf.put_f64_le(candle.open);
            buf.put_f64_le(candle.high);
            buf.put_f64_le(candle.low);
            buf.put_f64_le(candle.close);
            buf.put_f64_le(candle.volume);
        }
        Ok(())
    }

    pub fn decode(mut body: &[u8]) -> StorageResult<Self> {
        if body.remaining() < INSERT_HEAD_SIZE {
            return Err(StorageError::CorruptedRecord(format!(
                "insert head needs {} bytes, got {}",
                INSERT_HEAD_SIZE,
                body.remaining()
            )));
        }
        let year = body.get_u16_le();
        let candle_length = body.get_u32_le();
        let market_code = get_padded(&mut body, "market code", MAX_MARKET_CODE_LENGTH)?;
        let code = get_padded(&mut body, "code", MAX_CODE_LENGTH)?;
        let count = body.get_u32_le() as usize;

        let expected = count * TIMESTAMP_CANDLE_SIZE;
        if body.remaining() != expected {
            return Err(StorageError::CorruptedRecord(format!(
                "insert of {} candles needs {} bytes, got {}",
                count,
                expected,
                body.remaining()
            )));
        }

        let mut candles = Vec::with_capacity(count);
        for _ in 0..count {
            candles.push(TimestampCandle {
                timestamp: body.get_i64_le(),
                bit_fields: body.get_u32(),
                open: body.get_f64_le(),
                high: body.get_f64_le(),
                low: body.get_f64_le(),
                close: body.get_f64_le(),
                volume: body.get_f64_le(),
            });
        }

        Ok(Self {
            set: CandleSet::new(market_code, code, candle_length, year),
            candles,
        })
    }

    pub fn persist(&self, accessor: &mut dyn PageAccessor) -> StorageResult<()> {
        accessor.page_mut(&self.set)?.add(&self.candles)
    }
}

fn put_padded(buf: &mut BytesMut, field: &'static str, value: &str, width: usize) -> StorageResult<()> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(StorageError::FieldTooLong {
            field,
            max: width,
            actual: bytes.len(),
        });
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}

fn get_padded(body: &mut &[u8], field: &str, width: usize) -> StorageResult<String> {
    let raw = &body[..width];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
    let value = String::from_utf8(raw[..end].to_vec())
        .map_err(|_| StorageError::CorruptedRecord(format!("{} is not valid UTF-8", field)))?;
    body.advance(width);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::start_of_year;
    use crate::storage::page::Page;

    fn candle(timestamp: i64, close: f64) -> TimestampCandle {
        TimestampCandle {
            timestamp,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 10.0,
            bit_fields: 0x0102_0304,
        }
    }

    struct SinglePage(Page);

    impl PageAccessor for SinglePage {
        fn page_mut(&mut self, set: &CandleSet) -> StorageResult<&mut Page> {
            assert_eq!(&self.0.candle_set(), set);
            Ok(&mut self.0)
        }
    }

    #[test]
    fn test_encoded_layout() {
        let set = CandleSet::new("UPBIT", "BTC", 60, 2022);
        let command = InsertCommand::new(set, vec![candle(start_of_year(2022), 3.0)]);
        let mut buf = BytesMut::new();
        command.encode(&mut buf).unwrap();

        assert_eq!(INSERT_HEAD_SIZE, 38);
        assert_eq!(buf.len(), 38 + 52);
        assert_eq!(&buf[0..2], &2022u16.to_le_bytes());
        assert_eq!(&buf[2..6], &60u32.to_le_bytes());
        assert_eq!(&buf[6..11], b"UPBIT");
        assert_eq!(&buf[11..16], &[0u8; 5]);
        assert_eq!(&buf[16..19], b"BTC");
        assert_eq!(&buf[34..38], &1u32.to_le_bytes());
        assert_eq!(&buf[38..46], &start_of_year(2022).to_le_bytes());
        // Bitfield is big-endian on the wire.
        assert_eq!(&buf[46..50], &[0x01, 0x02, 0x03, 0x04]);

        let decoded = InsertCommand::decode(&buf).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_code_too_long() {
        let set = CandleSet::new("UPBIT", "A_VERY_LONG_CODE_NAME", 60, 2022);
        let command = InsertCommand::new(set, Vec::new());
        let mut buf = BytesMut::new();
        assert!(matches!(
            command.encode(&mut buf),
            Err(StorageError::FieldTooLong { field: "code", max: 18, .. })
        ));
    }

    #[test]
    fn test_truncated_body() {
        let set = CandleSet::new("UPBIT", "BTC", 60, 2022);
        let command = InsertCommand::new(set, vec![candle(start_of_year(2022), 3.0)]);
        let mut buf = BytesMut::new();
        command.encode(&mut buf).unwrap();

        assert!(matches!(
            InsertCommand::decode(&buf[..buf.len() - 1]),
            Err(StorageError::CorruptedRecord(_))
        ));
        assert!(matches!(
            InsertCommand::decode(&buf[..10]),
            Err(StorageError::CorruptedRecord(_))
        ));
    }

    #[test]
    fn test_persist_adds_candles() {
        let set = CandleSet::new("UPBIT", "BTC", 60, 2022);
        let start = start_of_year(2022);
        let command = InsertCommand::new(set.clone(), vec![candle(start + 60, 1.0), candle(start, 2.0)]);
        let mut accessor = SinglePage(Page::new(&set));

        command.persist(&mut accessor).unwrap();

        let stored = accessor.0.candles();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].timestamp, start);
        assert_eq!(stored[1].timestamp, start + 60);
    }

    #[test]
    fn test_persist_rejects_other_year() {
        let set = CandleSet::new("UPBIT", "BTC", 60, 2022);
        let command = InsertCommand::new(set.clone(), vec![candle(start_of_year(2023), 1.0)]);
        let mut accessor = SinglePage(Page::new(&set));

        assert!(matches!(
            command.persist(&mut accessor),
            Err(StorageError::TimestampOutOfRange { year: 2022, .. })
        ));
    }
}
