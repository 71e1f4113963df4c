//! candledb demo - concurrent candle writers against an embedded store

use anyhow::{Context, Result};
use candledb::candle::{Candle, CandleSetWithoutYear};
use candledb::config::Config;
use candledb::database::Database;
use chrono::{DateTime, Days, TimeZone, Utc};
use clap::Parser as ClapParser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// candledb - embedded OHLCV candle storage
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short = 'D', long, default_value = "./candledb_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Pages kept in memory before eviction
    #[arg(short = 'm', long, default_value = "2")]
    max_memory_pages: usize,

    /// Seconds between periodic eviction passes
    #[arg(long, default_value = "60")]
    eviction_interval: u64,

    /// Seconds between periodic WAL flushes
    #[arg(long, default_value = "60")]
    flush_interval: u64,

    /// Candles written per writer
    #[arg(short = 'n', long, default_value = "1000")]
    candles: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = Config {
        directory: args.data_dir.clone(),
        max_memory_pages: args.max_memory_pages,
        eviction_interval: Duration::from_secs(args.eviction_interval),
        flush_interval: Duration::from_secs(args.flush_interval),
        ..Config::default()
    };
    let database = Arc::new(Database::open(config).context("Failed to open database")?);
    info!("Data directory: {}", args.data_dir.display());

    let writers = [
        (Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0), "ETH"),
        (Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0), "BTC"),
        (Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0), "BTC"),
        (Utc.with_ymd_and_hms(2022, 7, 1, 0, 0, 0), "BTC"),
    ];

    let handles: Vec<_> = writers
        .into_iter()
        .map(|(start, code)| {
            let database = Arc::clone(&database);
            let count = args.candles;
            thread::spawn(move || -> Result<()> {
                let start = start.single().context("Invalid start date")?;
                run_writer(&database, start, code, count)
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("Writer thread panicked"))??;
    }

    if let Some(result) = database.flush_wal()? {
        info!("WAL flush: {}", result);
    }
    if let Some(result) = database.evict_memory()? {
        info!("Eviction: {}", result);
    }

    let database = Arc::try_unwrap(database)
        .map_err(|_| anyhow::anyhow!("Database is still shared"))?;
    database.close()
}

/// Writes `count` daily candles starting at `start`, then reads the first
/// year back.
fn run_writer(database: &Database, start: DateTime<Utc>, code: &str, count: usize) -> Result<()> {
    let candles: Vec<Candle> = (0..count)
        .filter_map(|i| {
            let timestamp = start.checked_add_days(Days::new(i as u64))?;
            let step = 5.0 * i as f64;
            Some(Candle {
                timestamp,
                open: 100.0 + step,
                high: 101.0 + step,
                low: 102.0 + step,
                close: 103.0 + step,
                volume: 104.0 + step,
                bit_fields: 0,
            })
        })
        .collect();

    let set = CandleSetWithoutYear::new("UPBIT", code, 60);
    let tx_id = database
        .write(&set, &candles)
        .with_context(|| format!("Failed to write {} candles for {}", candles.len(), code))?;

    let year = candles
        .first()
        .map(|candle| candle.year())
        .and_then(|year| u16::try_from(year).ok())
        .context("No candles written")?;
    let page = database.read_page(&set.with_year(year))?;
    info!(
        "{} wrote {} candles for {}; {} has {} blocks",
        tx_id,
        candles.len(),
        code,
        page.candle_set(),
        page.header.count
    );
    Ok(())
}
