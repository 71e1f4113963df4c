use anyhow::Result;
use candledb::candle::{start_of_year, Candle, CandleSet, CandleSetWithoutYear, TimestampCandle};
use candledb::command::{Command, CommandContent, InsertCommand};
use candledb::config::Config;
use candledb::database::Database;
use candledb::storage::wal::encode_record;
use candledb::storage::Disk;
use candledb::transaction::TransactionId;
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn candle_at(timestamp: i64, close: f64) -> Candle {
    Candle {
        timestamp: Utc.timestamp_opt(timestamp, 0).unwrap(),
        open: close - 1.0,
        high: close + 1.0,
        low: close - 2.0,
        close,
        volume: 10.0,
        bit_fields: 0x8000_0001,
    }
}

fn quiet_config(dir: &Path) -> Config {
    let mut config = Config::with_directory(dir);
    config.eviction_interval = Duration::from_secs(3600);
    config.flush_interval = Duration::from_secs(3600);
    config
}

fn write_wal_file(dir: &Path, name: &str, commands: &[Command]) -> Result<()> {
    let wal = dir.join("wal");
    std::fs::create_dir_all(&wal)?;
    let mut bytes = Vec::new();
    for command in commands {
        bytes.extend_from_slice(&encode_record(command)?);
    }
    std::fs::write(wal.join(name), bytes)?;
    Ok(())
}

#[test]
fn test_thousand_candles_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(quiet_config(dir.path()))?;
    let set = CandleSetWithoutYear::new("UPBIT", "BTC", 60);
    let start = start_of_year(2022);
    let candles: Vec<Candle> = (0..1000)
        .map(|i| candle_at(start + i * 3600, 100.0 + i as f64))
        .collect();

    db.write(&set, &candles)?;

    let page = db.read_page(&set.with_year(2022))?;
    assert_eq!(page.body.len(), 1000);
    assert_eq!(page.header.count, 1000);
    assert_eq!(page.header.start_offset, 0);
    assert_eq!(page.header.end_offset, 999 * 3600);
    assert_eq!(page.header.first_timestamp(), start);
    assert_eq!(page.header.last_timestamp(), start + 999 * 3600);
    assert_eq!(page.candles()[500], TimestampCandle::from(&candles[500]));

    db.close()?;

    // The same content is on disk after close.
    let on_disk = Disk::new(dir.path())
        .read(&set.with_year(2022))?
        .expect("page flushed on close");
    assert_eq!(on_disk.body, page.body);
    Ok(())
}

#[test]
fn test_concurrent_exclusive_writers() -> Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(Database::open(quiet_config(dir.path()))?);
    let set = CandleSet::new("UPBIT", "BTC", 60, 2022);
    let start = start_of_year(2022);

    let first_insert: CommandContent = InsertCommand::new(
        set.clone(),
        vec![TimestampCandle::from(&candle_at(start, 1.0))],
    )
    .into();
    let mut first = db.access();
    first.add_command(&first_insert);
    first.start()?;
    first.execute(&first_insert)?;

    let (done_tx, done_rx) = mpsc::channel();
    let second = {
        let db = Arc::clone(&db);
        let set = set.clone();
        thread::spawn(move || -> Result<()> {
            let insert: CommandContent = InsertCommand::new(
                set,
                vec![TimestampCandle::from(&candle_at(start + 60, 2.0))],
            )
            .into();
            let mut context = db.access();
            context.add_command(&insert);
            context.start()?;
            context.execute(&insert)?;
            context.commit()?;
            done_tx.send(())?;
            Ok(())
        })
    };

    // The second writer waits on the first one's X lock.
    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    first.commit()?;
    done_rx.recv_timeout(Duration::from_secs(5))?;
    second.join().unwrap()?;

    let page = db.read_page(&set)?;
    assert_eq!(page.body.len(), 2);

    Arc::try_unwrap(db)
        .map_err(|_| anyhow::anyhow!("database still shared"))?
        .close()
}

#[test]
fn test_eviction_writes_back_committed_state() -> Result<()> {
    let dir = tempdir()?;
    let mut config = quiet_config(dir.path());
    config.max_memory_pages = 2;
    let db = Database::open(config)?;
    let set = CandleSetWithoutYear::new("UPBIT", "BTC", 60);

    let mut written = Vec::new();
    for year in [2020, 2021, 2022] {
        let tx_id = db.write(&set, &[candle_at(start_of_year(year), f64::from(year))])?;
        written.push((set.with_year(year as u16), tx_id));
    }

    // A pass triggered by the cache overflow may already be running.
    while db.evict_memory()?.is_none() {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(db.cached_pages() <= 2);

    // Nothing was flushed from the WAL, so pages on disk come from eviction.
    let disk = Disk::new(dir.path());
    let mut evicted = 0;
    for (page_set, tx_id) in &written {
        if let Some(page) = disk.read(page_set)? {
            assert_eq!(page.last_tx_id(), tx_id.value());
            assert_eq!(page.body.len(), 1);
            evicted += 1;
        }
    }
    assert!(evicted >= 1);

    // Evicted pages reload with their committed content.
    for (page_set, tx_id) in &written {
        let page = db.read_page(page_set)?;
        assert_eq!(page.last_tx_id(), tx_id.value());
        assert_eq!(page.candles()[0].close, f64::from(page_set.year));
    }

    db.close()
}

#[test]
fn test_reopen_replays_committed_wal() -> Result<()> {
    let dir = tempdir()?;
    let set = CandleSetWithoutYear::new("UPBIT", "ETH", 60);
    let tx_id = {
        let db = Database::open(quiet_config(dir.path()))?;
        let tx_id = db.write(&set, &[candle_at(start_of_year(2022) + 60, 7.0)])?;
        // Dropped without close: the current WAL file is not flushed.
        drop(db);
        tx_id
    };
    assert!(Disk::new(dir.path()).read(&set.with_year(2022))?.is_none());

    let db = Database::open(quiet_config(dir.path()))?;
    let page = Disk::new(dir.path())
        .read(&set.with_year(2022))?
        .expect("replayed at open");
    assert_eq!(page.last_tx_id(), tx_id.value());
    assert_eq!(db.read_page(&set.with_year(2022))?.body.len(), 1);

    // New ids continue after the recovered ones.
    let next = db.write(&set, &[candle_at(start_of_year(2022) + 120, 8.0)])?;
    assert!(next > tx_id);
    db.close()
}

#[test]
fn test_uncommitted_wal_is_discarded() -> Result<()> {
    let dir = tempdir()?;
    let set = CandleSet::new("UPBIT", "XRP", 60, 2022);
    let candle = TimestampCandle::from(&candle_at(start_of_year(2022), 1.0));
    let committed = TransactionId::new(1);
    let dangling = TransactionId::new(2);
    write_wal_file(
        dir.path(),
        "wal.100000000000001.log",
        &[
            Command::new(committed, InsertCommand::new(set.clone(), vec![candle]).into()),
            Command::new(
                dangling,
                InsertCommand::new(
                    set.clone(),
                    vec![TimestampCandle::from(&candle_at(start_of_year(2022) + 60, 2.0))],
                )
                .into(),
            ),
            Command::commit(committed),
        ],
    )?;

    let db = Database::open(quiet_config(dir.path()))?;
    let page = db.read_page(&set)?;
    assert_eq!(page.body.len(), 1);
    assert_eq!(page.last_tx_id(), 1);
    db.close()
}

#[test]
fn test_replay_of_applied_log_is_noop() -> Result<()> {
    let dir = tempdir()?;
    let set = CandleSetWithoutYear::new("UPBIT", "SOL", 60);
    let page_set = set.with_year(2022);
    let timestamp = start_of_year(2022);

    let tx_id = {
        let db = Database::open(quiet_config(dir.path()))?;
        let tx_id = db.write(&set, &[candle_at(timestamp, 5.0)])?;
        db.close()?;
        tx_id
    };
    let before = Disk::new(dir.path()).read(&page_set)?.expect("flushed on close");

    // A stale log claiming an older value for the same second.
    let stale = Command::new(
        tx_id,
        InsertCommand::new(
            page_set.clone(),
            vec![TimestampCandle::from(&candle_at(timestamp, 99.0))],
        )
        .into(),
    );
    write_wal_file(
        dir.path(),
        "wal.100000000000002.log",
        &[stale, Command::commit(tx_id)],
    )?;

    let db = Database::open(quiet_config(dir.path()))?;
    let after = Disk::new(dir.path()).read(&page_set)?.expect("still on disk");
    assert_eq!(after, before);
    assert_eq!(db.read_page(&page_set)?.candles()[0].close, 5.0);
    db.close()
}
