//! Naming and discovery of WAL files.

use crate::storage::error::StorageResult;
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const WAL_FILE_PREFIX: &str = "wal.";
const WAL_FILE_SUFFIX: &str = ".log";
const COUNTER_FILE_NAME: &str = "counter";

/// Resolves paths inside the WAL directory.
#[derive(Debug, Clone)]
pub struct WalFileResolver {
    directory: PathBuf,
}

impl WalFileResolver {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn ensure_directory(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.directory)?;
        Ok(())
    }

    pub fn counter_path(&self) -> PathBuf {
        self.directory.join(COUNTER_FILE_NAME)
    }

    /// `wal.<unix millis><tx id mod 100000, 5 digits>.log`
    pub fn file_name(unix_millis: i64, tx_id: u64) -> String {
        format!(
            "{}{}{:05}{}",
            WAL_FILE_PREFIX,
            unix_millis,
            tx_id % 100_000,
            WAL_FILE_SUFFIX
        )
    }

    pub fn is_wal_file(name: &str) -> bool {
        name.starts_with(WAL_FILE_PREFIX) && name.ends_with(WAL_FILE_SUFFIX)
    }

    /// Creates a new, empty log file. When the name for the current
    /// millisecond is taken, the next millisecond is tried.
    pub fn create_file(&self, tx_id: u64) -> StorageResult<(File, PathBuf)> {
        let mut now = Utc::now().timestamp_millis();
        loop {
            let path = self.directory.join(Self::file_name(now, tx_id));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((file, path)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => now += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Every log file in the directory, oldest first.
    pub fn all_files(&self) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name().to_str().is_some_and(Self::is_wal_file) {
                files.push(entry.path());
            }
        }
        files.sort_by_key(|path| sort_key(path));
        Ok(files)
    }
}

fn sort_key(path: &Path) -> (u128, String) {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let number = name
        .strip_prefix(WAL_FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(WAL_FILE_SUFFIX))
        .and_then(|digits| digits.parse::<u128>().ok())
        .unwrap_or(u128::MAX);
    (number, name.to_string())
}
