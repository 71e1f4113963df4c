//! WAL record framing.
//!
//! Every record is `[u32 body size][u64 tx id][u32 command type][body]`, all
//! little-endian. A record cut short at the end of a file is the tail of an
//! interrupted append and ends the file.

use crate::command::{Command, CommandContent};
use crate::storage::error::{StorageError, StorageResult};
use crate::transaction::TransactionId;
use bytes::{Buf, BufMut, BytesMut};
use log::warn;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 4;

/// Encodes one command as a complete record.
pub fn encode_record(command: &Command) -> StorageResult<BytesMut> {
    let body_len = command.content.body_len();
    let body_size = u32::try_from(body_len).map_err(|_| {
        StorageError::CorruptedRecord(format!("record body of {} bytes is too large", body_len))
    })?;

    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + body_len);
    buf.put_u32_le(body_size);
    buf.put_u64_le(command.tx_id.value());
    buf.put_u32_le(command.content.type_id());
    command.content.encode_body(&mut buf)?;
    debug_assert_eq!(buf.len(), RECORD_HEADER_SIZE + body_len);
    Ok(buf)
}

/// Sequential reader over the records of one log.
pub struct WalRecordReader<R> {
    reader: R,
}

impl WalRecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> StorageResult<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> WalRecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next record, or `None` at the end of the log.
    pub fn next_record(&mut self) -> StorageResult<Option<Command>> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        match read_full(&mut self.reader, &mut header)? {
            0 => return Ok(None),
            n if n < RECORD_HEADER_SIZE => {
                warn!("Ignoring torn WAL record header ({} of {} bytes)", n, RECORD_HEADER_SIZE);
                return Ok(None);
            }
            _ => {}
        }

        let mut cursor = &header[..];
        let body_size = cursor.get_u32_le() as usize;
        let tx_id = TransactionId::new(cursor.get_u64_le());
        let type_id = cursor.get_u32_le();

        // Sized by what the file holds, not by the header.
        let mut body = Vec::new();
        let read = read_up_to(&mut self.reader, body_size, &mut body)?;
        if read < body_size {
            warn!(
                "Ignoring torn WAL record body for {} ({} of {} bytes)",
                tx_id, read, body_size
            );
            return Ok(None);
        }

        let content = CommandContent::decode(type_id, &body)?;
        Ok(Some(Command::new(tx_id, content)))
    }

    /// Reads every remaining record.
    pub fn read_all(&mut self) -> StorageResult<Vec<Command>> {
        let mut commands = Vec::new();
        while let Some(command) = self.next_record()? {
            commands.push(command);
        }
        Ok(commands)
    }
}

/// Appends at most `limit` bytes to `buf`. Returns the bytes read.
fn read_up_to<R: Read>(reader: &mut R, limit: usize, buf: &mut Vec<u8>) -> StorageResult<usize> {
    Ok(reader.take(limit as u64).read_to_end(buf)?)
}

/// Fills `buf` as far as the reader allows. Returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> StorageResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::{start_of_year, CandleSet, TimestampCandle};
    use crate::command::{InsertCommand, COMMIT_COMMAND_TYPE, INSERT_COMMAND_TYPE};

    fn insert(tx: u64) -> Command {
        let candles = (0..3)
            .map(|i| TimestampCandle {
                timestamp: start_of_year(2022) + i * 60,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 100.0,
                bit_fields: 0,
            })
            .collect();
        Command::new(
            TransactionId::new(tx),
            InsertCommand::new(CandleSet::new("UPBIT", "BTC", 60, 2022), candles).into(),
        )
    }

    #[test]
    fn test_record_header() {
        let record = encode_record(&Command::commit(TransactionId::new(0x0102))).unwrap();
        assert_eq!(record.len(), RECORD_HEADER_SIZE);
        assert_eq!(&record[0..4], &0u32.to_le_bytes());
        assert_eq!(&record[4..12], &0x0102u64.to_le_bytes());
        assert_eq!(&record[12..16], &COMMIT_COMMAND_TYPE.to_le_bytes());

        let record = encode_record(&insert(7)).unwrap();
        assert_eq!(&record[0..4], &((38 + 3 * 52) as u32).to_le_bytes());
        assert_eq!(&record[12..16], &INSERT_COMMAND_TYPE.to_le_bytes());
    }

    #[test]
    fn test_read_sequence() {
        let commands = vec![insert(1), insert(2), Command::commit(TransactionId::new(1))];
        let mut log = Vec::new();
        for command in &commands {
            log.extend_from_slice(&encode_record(command).unwrap());
        }

        let read = WalRecordReader::new(&log[..]).read_all().unwrap();
        assert_eq!(read, commands);
    }

    #[test]
    fn test_torn_tail_ends_log() {
        let mut log = Vec::new();
        log.extend_from_slice(&encode_record(&insert(1)).unwrap());
        log.extend_from_slice(&encode_record(&Command::commit(TransactionId::new(1))).unwrap());
        let complete = log.len();
        log.extend_from_slice(&encode_record(&insert(2)).unwrap());

        let torn_body = WalRecordReader::new(&log[..log.len() - 10]).read_all().unwrap();
        assert_eq!(torn_body.len(), 2);

        let torn_header = WalRecordReader::new(&log[..complete + 5]).read_all().unwrap();
        assert_eq!(torn_header.len(), 2);
    }

    #[test]
    fn test_oversized_body_length_is_torn() {
        let mut log = Vec::new();
        log.extend_from_slice(&encode_record(&insert(1)).unwrap());
        log.extend_from_slice(&u32::MAX.to_le_bytes());
        log.extend_from_slice(&2u64.to_le_bytes());
        log.extend_from_slice(&INSERT_COMMAND_TYPE.to_le_bytes());
        log.extend_from_slice(&[0u8; 16]);

        let read = WalRecordReader::new(&log[..]).read_all().unwrap();
        assert_eq!(read, vec![insert(1)]);
    }

    #[test]
    fn test_unknown_type_is_error() {
        let mut log = Vec::new();
        log.extend_from_slice(&0u32.to_le_bytes());
        log.extend_from_slice(&1u64.to_le_bytes());
        log.extend_from_slice(&42u32.to_le_bytes());

        assert!(matches!(
            WalRecordReader::new(&log[..]).next_record(),
            Err(StorageError::UnknownCommandType(42))
        ));
    }
}
