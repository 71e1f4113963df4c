//! Durable transaction id counter.

use crate::storage::error::StorageResult;
use crate::transaction::TransactionId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom};
use std::path::Path;

struct CounterFile {
    file: File,
    value: u64,
}

/// Monotonic counter persisted as 8 little-endian bytes.
///
/// A value is written and synced before [`WalCounter::next`] returns it, so
/// an id is never handed out twice across restarts.
pub struct WalCounter {
    inner: Mutex<CounterFile>,
}

impl WalCounter {
    /// Opens the counter file, creating it with value 0 when missing or short.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let value = match file.read_u64::<LittleEndian>() {
            Ok(value) => value,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                store(&mut file, 0)?;
                0
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            inner: Mutex::new(CounterFile { file, value }),
        })
    }

    /// Last id handed out, without advancing.
    pub fn now(&self) -> u64 {
        self.inner.lock().value
    }

    pub fn next(&self) -> StorageResult<TransactionId> {
        let mut inner = self.inner.lock();
        let next = TransactionId::new(inner.value).successor();
        store(&mut inner.file, next.value())?;
        inner.value = next.value();
        Ok(next)
    }
}

fn store(file: &mut File, value: u64) -> StorageResult<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_u64::<LittleEndian>(value)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_counter_starts_at_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter");
        let counter = WalCounter::open(&path).unwrap();

        assert_eq!(counter.now(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), 0u64.to_le_bytes());
    }

    #[test]
    fn test_counter_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter");
        {
            let counter = WalCounter::open(&path).unwrap();
            assert_eq!(counter.next().unwrap(), TransactionId::new(1));
            assert_eq!(counter.next().unwrap(), TransactionId::new(2));
            assert_eq!(counter.now(), 2);
        }

        assert_eq!(std::fs::read(&path).unwrap(), 2u64.to_le_bytes());
        let counter = WalCounter::open(&path).unwrap();
        assert_eq!(counter.now(), 2);
        assert_eq!(counter.next().unwrap(), TransactionId::new(3));
    }

    #[test]
    fn test_counter_concurrent_ids_are_unique() {
        let dir = tempdir().unwrap();
        let counter = std::sync::Arc::new(WalCounter::open(&dir.path().join("counter")).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| counter.next().unwrap().value())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=100).collect::<Vec<_>>());
    }
}
