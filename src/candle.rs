//! Candle data types and the identity of the page a candle belongs to.
//!
//! A [`Candle`] carries a calendar timestamp and is what callers hand to the
//! database. Inside pages and WAL records candles travel as
//! [`TimestampCandle`]s, whose timestamp is plain UTC seconds.

use crate::concurrency::resource::ResourceName;
use crate::storage::error::{StorageError, StorageResult};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Seconds in one calendar day.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// One OHLCV sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bit_fields: u32,
}

impl Candle {
    /// Calendar year of the candle in UTC.
    pub fn year(&self) -> i32 {
        self.timestamp.year()
    }
}

/// Wire and on-disk form of a [`Candle`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampCandle {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bit_fields: u32,
}

impl From<&Candle> for TimestampCandle {
    fn from(candle: &Candle) -> Self {
        Self {
            timestamp: candle.timestamp.timestamp(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            bit_fields: candle.bit_fields,
        }
    }
}

impl From<Candle> for TimestampCandle {
    fn from(candle: Candle) -> Self {
        Self::from(&candle)
    }
}

impl TimestampCandle {
    /// Converts back to a calendar candle. Returns `None` when the timestamp
    /// cannot be represented as a date.
    pub fn to_candle(&self) -> Option<Candle> {
        let timestamp = Utc.timestamp_opt(self.timestamp, 0).single()?;
        Some(Candle {
            timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            bit_fields: self.bit_fields,
        })
    }
}

/// Unix timestamp of `year-01-01T00:00:00Z`.
pub fn start_of_year(year: i32) -> i64 {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc().timestamp())
        .unwrap_or(i64::MIN)
}

/// Page identity without the year component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleSetWithoutYear {
    pub market_code: String,
    pub code: String,
    pub candle_length: u32,
}

impl CandleSetWithoutYear {
    pub fn new(market_code: impl Into<String>, code: impl Into<String>, candle_length: u32) -> Self {
        Self {
            market_code: market_code.into(),
            code: code.into(),
            candle_length,
        }
    }

    pub fn with_year(&self, year: u16) -> CandleSet {
        CandleSet {
            market_code: self.market_code.clone(),
            code: self.code.clone(),
            candle_length: self.candle_length,
            year,
        }
    }
}

/// The logical identity of one page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandleSet {
    pub market_code: String,
    pub code: String,
    pub candle_length: u32,
    /// Zero means "unset".
    pub year: u16,
}

impl CandleSet {
    pub fn new(
        market_code: impl Into<String>,
        code: impl Into<String>,
        candle_length: u32,
        year: u16,
    ) -> Self {
        Self {
            market_code: market_code.into(),
            code: code.into(),
            candle_length,
            year,
        }
    }

    /// Canonical key used by the page cache and the flusher.
    pub fn unique_key(&self) -> String {
        format!(
            "{}^{}^{}^{}",
            self.market_code, self.code, self.candle_length, self.year
        )
    }

    pub fn is_zero(&self) -> bool {
        self.year == 0
    }

    pub fn without_year(&self) -> CandleSetWithoutYear {
        CandleSetWithoutYear {
            market_code: self.market_code.clone(),
            code: self.code.clone(),
            candle_length: self.candle_length,
        }
    }

    /// Lock resource for this page: `db / market / code / length:year`.
    pub fn resource_name(&self) -> ResourceName {
        ResourceName::root()
            .child(self.market_code.as_str())
            .child(self.code.as_str())
            .child(format!("{}:{}", self.candle_length, self.year))
    }

    /// Whether `timestamp` falls inside `[start of year, start of next year)`.
    pub fn contains_timestamp(&self, timestamp: i64) -> bool {
        let year = i32::from(self.year);
        start_of_year(year) <= timestamp && timestamp < start_of_year(year + 1)
    }
}

impl fmt::Display for CandleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.market_code, self.code, self.candle_length, self.year
        )
    }
}

/// Groups candles by their UTC calendar year, preserving input order within
/// each year.
pub fn split_by_year(candles: &[Candle]) -> StorageResult<BTreeMap<u16, Vec<Candle>>> {
    let mut years: BTreeMap<u16, Vec<Candle>> = BTreeMap::new();
    for candle in candles {
        let year = u16::try_from(candle.year())
            .ok()
            .filter(|year| *year != 0)
            .ok_or(StorageError::TimestampOutOfRange {
                year: 0,
                timestamp: candle.timestamp.timestamp(),
            })?;
        years.entry(year).or_default().push(*candle);
    }
    Ok(years)
}
