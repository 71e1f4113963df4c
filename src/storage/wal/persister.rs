//! Appending committed work to the current log file.

use super::record::encode_record;
use super::{WalCounter, WalFileResolver};
use crate::command::Command;
use crate::storage::error::StorageResult;
use log::{debug, info};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// The log file currently receiving records.
pub struct WalWriteFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl WalWriteFile {
    fn new(file: File, path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and syncs it.
    pub fn append(&self, command: &Command) -> StorageResult<()> {
        let record = encode_record(command)?;
        let mut file = self.file.lock();
        file.write_all(&record)?;
        file.sync_data()?;
        Ok(())
    }
}

/// Owns the current log file and rotates it after a number of finished
/// transactions.
///
/// Every open [`PersistRunner`] holds a shared guard on the current file, so
/// rotation waits until the transactions writing to it have finished and a
/// transaction never spans two files.
pub struct WalPersister {
    resolver: Arc<WalFileResolver>,
    counter: Arc<WalCounter>,
    current: Arc<RwLock<WalWriteFile>>,
    finished: AtomicUsize,
    rotate_threshold: usize,
    rotate_signal: Arc<Notify>,
}

impl WalPersister {
    pub fn open(
        resolver: Arc<WalFileResolver>,
        counter: Arc<WalCounter>,
        rotate_threshold: usize,
        rotate_signal: Arc<Notify>,
    ) -> StorageResult<Self> {
        let (file, path) = resolver.create_file(counter.now())?;
        debug!("Opened WAL file {}", path.display());
        Ok(Self {
            resolver,
            counter,
            current: Arc::new(RwLock::new(WalWriteFile::new(file, path))),
            finished: AtomicUsize::new(0),
            rotate_threshold: rotate_threshold.max(1),
            rotate_signal,
        })
    }

    pub fn current_path(&self) -> PathBuf {
        self.current.read().path.clone()
    }

    /// Every log file on disk except the current one, oldest first.
    ///
    /// Lists under the current-file lock so a concurrent rotation cannot
    /// slip the new current file into the result.
    pub fn closed_files(&self) -> StorageResult<Vec<PathBuf>> {
        let current = self.current.read_recursive();
        let files = self.resolver.all_files()?;
        Ok(files.into_iter().filter(|file| *file != current.path).collect())
    }

    pub fn needs_rotation(&self) -> bool {
        self.finished.load(Ordering::Acquire) >= self.rotate_threshold
    }

    /// Starts writing one transaction to the current file.
    pub fn runner(self: &Arc<Self>) -> PersistRunner {
        PersistRunner {
            persister: self.clone(),
            file: Some(self.current.read_arc()),
        }
    }

    /// Switches to a fresh log file when the threshold has been reached.
    /// Returns the path of the file that was closed.
    pub fn rotate(&self) -> StorageResult<Option<PathBuf>> {
        self.rotate_if(|persister| persister.needs_rotation())
    }

    /// Closes the current file if any transaction has finished on it, so
    /// everything committed so far can be flushed.
    pub fn seal(&self) -> StorageResult<Option<PathBuf>> {
        self.rotate_if(|persister| persister.finished.load(Ordering::Acquire) > 0)
    }

    fn rotate_if(&self, condition: impl Fn(&Self) -> bool) -> StorageResult<Option<PathBuf>> {
        let mut current = self.current.write();
        if !condition(self) {
            return Ok(None);
        }
        let (file, path) = self.resolver.create_file(self.counter.now())?;
        let previous = std::mem::replace(&mut *current, WalWriteFile::new(file, path));
        self.finished.store(0, Ordering::Release);
        info!(
            "Rotated WAL file {} -> {}",
            previous.path.display(),
            current.path.display()
        );
        Ok(Some(previous.path))
    }

    fn finish_transaction(&self) {
        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if finished >= self.rotate_threshold {
            self.rotate_signal.notify_one();
        }
    }
}

/// Write handle for one transaction.
pub struct PersistRunner {
    persister: Arc<WalPersister>,
    file: Option<ArcRwLockReadGuard<RawRwLock, WalWriteFile>>,
}

impl PersistRunner {
    /// Appends `command` to the log.
    ///
    /// # Panics
    ///
    /// Panics when called after [`PersistRunner::close`].
    pub fn write(&self, command: &Command) -> StorageResult<()> {
        match &self.file {
            Some(file) => file.append(command),
            None => panic!("WAL write for {} after the runner was closed", command.tx_id),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Releases the current file. Safe to call more than once.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            self.persister.finish_transaction();
        }
    }
}

impl Drop for PersistRunner {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::WalRecordReader;
    use crate::transaction::TransactionId;
    use tempfile::tempdir;

    fn persister(dir: &Path, threshold: usize) -> Arc<WalPersister> {
        let resolver = Arc::new(WalFileResolver::new(dir));
        let counter = Arc::new(WalCounter::open(&resolver.counter_path()).unwrap());
        Arc::new(
            WalPersister::open(resolver, counter, threshold, Arc::new(Notify::new())).unwrap(),
        )
    }

    #[test]
    fn test_runner_appends_to_current_file() {
        let dir = tempdir().unwrap();
        let persister = persister(dir.path(), 10);
        let mut runner = persister.runner();
        runner.write(&Command::commit(TransactionId::new(1))).unwrap();
        runner.write(&Command::commit(TransactionId::new(2))).unwrap();
        runner.close();
        runner.close();

        let records = WalRecordReader::open(&persister.current_path())
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(!persister.needs_rotation());
    }

    #[test]
    fn test_rotate_after_threshold() {
        let dir = tempdir().unwrap();
        let persister = persister(dir.path(), 2);
        let first = persister.current_path();

        persister.runner().close();
        assert_eq!(persister.rotate().unwrap(), None);
        drop(persister.runner());
        assert!(persister.needs_rotation());

        assert_eq!(persister.rotate().unwrap(), Some(first.clone()));
        assert_ne!(persister.current_path(), first);
        assert!(!persister.needs_rotation());
        assert_eq!(persister.rotate().unwrap(), None);
    }

    #[test]
    fn test_rotation_waits_for_open_runner() {
        let dir = tempdir().unwrap();
        let persister = persister(dir.path(), 1);
        let first = persister.current_path();
        let mut runner = persister.runner();

        let rotating = {
            let persister = persister.clone();
            std::thread::spawn(move || persister.seal().unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!rotating.is_finished());

        runner.write(&Command::commit(TransactionId::new(1))).unwrap();
        runner.close();
        assert_eq!(rotating.join().unwrap(), Some(first.clone()));
        assert_eq!(persister.seal().unwrap(), None);

        let records = WalRecordReader::open(&first).unwrap().read_all().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    #[should_panic(expected = "after the runner was closed")]
    fn test_write_after_close_panics() {
        let dir = tempdir().unwrap();
        let persister = persister(dir.path(), 10);
        let mut runner = persister.runner();
        runner.close();
        let _ = runner.write(&Command::commit(TransactionId::new(1)));
    }
}
