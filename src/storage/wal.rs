//! Append-only write-ahead log.
//!
//! File layout: `[x_checksum:4 LE]` followed by framed records, each
//! `[size:4 LE][checksum:4 LE][data:size]`. The per-record checksum folds the
//! data bytes; the aggregate `x_checksum` folds every record's full frame.
//! A record is durable only once the aggregate rewrite has been fsynced, so
//! anything past the last frame the aggregate covers is a torn tail and is
//! truncated on open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use parking_lot::Mutex;

use crate::errors::BrambleError;

const SEED: i32 = 13331;

const OF_SIZE: usize = 0;
const OF_CHECKSUM: usize = 4;
const OF_DATA: usize = 8;

/// Offset of the first record; the 4 bytes before it hold `x_checksum`.
const LOG_START: u64 = 4;

fn fold(mut check: i32, bytes: &[u8]) -> i32 {
    for &b in bytes {
        check = check.wrapping_mul(SEED).wrapping_add(b as i8 as i32);
    }
    check
}

fn wrap(data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; OF_DATA + data.len()];
    LittleEndian::write_u32(&mut frame[OF_SIZE..OF_CHECKSUM], data.len() as u32);
    LittleEndian::write_i32(&mut frame[OF_CHECKSUM..OF_DATA], fold(0, data));
    frame[OF_DATA..].copy_from_slice(data);
    frame
}

#[derive(Debug)]
pub struct Logger {
    state: Mutex<LoggerState>,
}

#[derive(Debug)]
struct LoggerState {
    file: File,
    x_checksum: i32,
    file_size: u64,
    /// Read cursor for `next`; one-shot after open, never interleaved with
    /// `log`.
    position: u64,
}

impl Logger {
    pub fn create(path: &Path) -> Result<Self, BrambleError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&0i32.to_le_bytes())?;
        file.sync_data()?;
        Ok(Self {
            state: Mutex::new(LoggerState {
                file,
                x_checksum: 0,
                file_size: LOG_START,
                position: LOG_START,
            }),
        })
    }

    /// Open an existing log: validate every record against the stored
    /// aggregate checksum and truncate the torn tail, if any.
    pub fn open(path: &Path) -> Result<Self, BrambleError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < LOG_START {
            return Err(BrambleError::BadLogFile);
        }
        file.seek(SeekFrom::Start(0))?;
        let mut head = [0u8; 4];
        file.read_exact(&mut head)?;
        let logger = Self {
            state: Mutex::new(LoggerState {
                file,
                x_checksum: i32::from_le_bytes(head),
                file_size,
                position: LOG_START,
            }),
        };
        logger.check_and_remove_tail()?;
        Ok(logger)
    }

    fn check_and_remove_tail(&self) -> Result<(), BrambleError> {
        let mut state = self.state.lock();
        state.position = LOG_START;
        let mut x_check = 0i32;
        while let Some(frame) = state.next_frame()? {
            x_check = fold(x_check, &frame);
        }
        if x_check != state.x_checksum {
            return Err(BrambleError::BadLogFile);
        }
        let end = state.position;
        if end < state.file_size {
            warn!(
                "truncating {} bytes of torn log tail",
                state.file_size - end
            );
            state.file.set_len(end)?;
            state.file_size = end;
        }
        state.file.seek(SeekFrom::Start(end))?;
        state.position = LOG_START;
        Ok(())
    }

    /// Append one record, fold it into the aggregate checksum, rewrite the
    /// aggregate and fsync. On return the record is durable.
    pub fn log(&self, data: &[u8]) -> Result<(), BrambleError> {
        let mut state = self.state.lock();
        let frame = wrap(data);
        let at = state.file_size;
        state.file.seek(SeekFrom::Start(at))?;
        state.file.write_all(&frame)?;
        state.file_size += frame.len() as u64;
        state.x_checksum = fold(state.x_checksum, &frame);
        let head = state.x_checksum.to_le_bytes();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&head)?;
        state.file.sync_data()?;
        Ok(())
    }

    /// Reset the read cursor to the first record.
    pub fn rewind(&self) {
        self.state.lock().position = LOG_START;
    }

    /// Yield the next record's data, or `None` at the end of the validated
    /// log (a short header, a size past end-of-file, or a checksum mismatch
    /// all end iteration).
    pub fn next(&self) -> Result<Option<Vec<u8>>, BrambleError> {
        let mut state = self.state.lock();
        match state.next_frame()? {
            Some(frame) => Ok(Some(frame[OF_DATA..].to_vec())),
            None => Ok(None),
        }
    }

    /// Cut the log at `pos`. Shares the mutex with `log`.
    pub fn truncate(&self, pos: u64) -> Result<(), BrambleError> {
        let mut state = self.state.lock();
        state.file.set_len(pos)?;
        state.file.sync_data()?;
        state.file_size = pos;
        if state.position > pos {
            state.position = pos;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), BrambleError> {
        self.state.lock().file.sync_data()?;
        Ok(())
    }
}

impl LoggerState {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, BrambleError> {
        if self.position + OF_DATA as u64 > self.file_size {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(self.position))?;
        let mut header = [0u8; OF_DATA];
        self.file.read_exact(&mut header)?;
        let size = LittleEndian::read_u32(&header[OF_SIZE..OF_CHECKSUM]) as usize;
        if self.position + (OF_DATA + size) as u64 > self.file_size {
            return Ok(None);
        }
        let mut frame = vec![0u8; OF_DATA + size];
        frame[..OF_DATA].copy_from_slice(&header);
        self.file.read_exact(&mut frame[OF_DATA..])?;

        let stored = LittleEndian::read_i32(&frame[OF_CHECKSUM..OF_DATA]);
        if fold(0, &frame[OF_DATA..]) != stored {
            return Ok(None);
        }
        self.position += frame.len() as u64;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn fold_matches_definition() {
        assert_eq!(fold(0, &[0x01]), 1);
        assert_eq!(fold(0, &[0x02, 0x03]), 2 * 13331 + 3);
        // Bytes are sign-extended.
        assert_eq!(fold(0, &[0xFF]), -1);
    }

    #[test]
    fn log_and_iterate() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test.log");
        let logger = Logger::create(&path).unwrap();
        logger.log(&[0x01]).unwrap();
        logger.log(&[0x02, 0x03]).unwrap();

        let logger = Logger::open(&path).unwrap();
        logger.rewind();
        assert_eq!(logger.next().unwrap(), Some(vec![0x01]));
        assert_eq!(logger.next().unwrap(), Some(vec![0x02, 0x03]));
        assert_eq!(logger.next().unwrap(), None);
    }

    #[test]
    fn open_truncates_torn_tail() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test.log");
        {
            let logger = Logger::create(&path).unwrap();
            logger.log(&[0x01]).unwrap();
            logger.log(&[0x02, 0x03]).unwrap();
        }
        let clean_len = fs::metadata(&path).unwrap().len();

        let mut garbled = fs::read(&path).unwrap();
        garbled.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        fs::write(&path, &garbled).unwrap();

        let logger = Logger::open(&path).unwrap();
        logger.rewind();
        assert_eq!(logger.next().unwrap(), Some(vec![0x01]));
        assert_eq!(logger.next().unwrap(), Some(vec![0x02, 0x03]));
        assert_eq!(logger.next().unwrap(), None);
        drop(logger);
        assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
    }

    #[test]
    fn corrupted_record_body_fails_open() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test.log");
        {
            let logger = Logger::create(&path).unwrap();
            logger.log(&[0x01, 0x02, 0x03, 0x04]).unwrap();
        }

        // Flip a data byte: the record fails its own checksum, so it becomes
        // tail, and the stored aggregate no longer matches the empty prefix.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        fs::write(&path, &bytes).unwrap();

        let err = Logger::open(&path).unwrap_err();
        assert!(matches!(err, BrambleError::BadLogFile));
    }

    #[test]
    fn aggregate_checksum_is_rewritten_per_record() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test.log");
        let logger = Logger::create(&path).unwrap();

        logger.log(&[0x01]).unwrap();
        let after_one = fs::read(&path).unwrap();
        let expected = fold(0, &after_one[LOG_START as usize..]);
        assert_eq!(LittleEndian::read_i32(&after_one[..4]), expected);

        logger.log(&[0x02, 0x03]).unwrap();
        let after_two = fs::read(&path).unwrap();
        let expected = fold(0, &after_two[LOG_START as usize..]);
        assert_eq!(LittleEndian::read_i32(&after_two[..4]), expected);
    }
}
