//! Positioned reads and writes on the database file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::codec::{self, SlotFlag, RECORD_WIDTH, SLOT_WIDTH};
use crate::error::{DbError, Result};
use crate::Record;

/// Handle to the database file.
///
/// Every call seeks and reads or writes while holding the handle, so
/// concurrent callers interleave only at whole-call granularity.
#[derive(Debug)]
pub struct DataFile {
    inner: Mutex<Option<File>>,
    sync_writes: bool,
}

impl DataFile {
    /// Open an existing database file for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            inner: Mutex::new(Some(file)),
            sync_writes,
        })
    }

    fn handle(&self) -> MutexGuard<'_, Option<File>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> std::io::Result<T>) -> Result<T> {
        let mut guard = self.handle();
        let file = guard.as_mut().ok_or(DbError::Closed)?;
        Ok(op(file)?)
    }

    fn write_at(&self, pos: u64, bytes: &[u8]) -> Result<()> {
        let sync = self.sync_writes;
        self.with_file(|file| {
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(bytes)?;
            if sync {
                file.sync_data()?;
            }
            Ok(())
        })
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64> {
        self.with_file(|file| Ok(file.metadata()?.len()))
    }

    /// Fill `buf` from absolute position `pos`.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(buf)
        })
    }

    /// Read the raw flag byte at `pos`.
    pub fn read_flag(&self, pos: u64) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_at(pos, &mut byte)?;
        Ok(byte[0])
    }

    /// Overwrite the flag byte at `pos`.
    pub fn write_flag(&self, pos: u64, flag: SlotFlag) -> Result<()> {
        self.write_at(pos, &[flag.to_byte()])
    }

    /// Read and decode the field data starting at `pos`.
    pub fn read_record(&self, pos: u64) -> Result<Record> {
        let mut bytes = [0u8; RECORD_WIDTH];
        self.read_at(pos, &mut bytes)?;
        Ok(codec::decode(&bytes))
    }

    /// Encode and write field data starting at `pos`.
    pub fn write_record(&self, pos: u64, record: &Record) -> Result<()> {
        self.write_at(pos, &codec::encode(record))
    }

    /// Write a whole slot, flag and fields, in one call.
    pub fn write_slot(&self, pos: u64, flag: SlotFlag, record: &Record) -> Result<()> {
        let mut slot = Vec::with_capacity(SLOT_WIDTH);
        slot.push(flag.to_byte());
        slot.extend_from_slice(&codec::encode(record));
        self.write_at(pos, &slot)
    }

    /// Flush and release the handle. Later calls fail with [`DbError::Closed`].
    pub fn close(&self) -> Result<()> {
        match self.handle().take() {
            Some(file) => Ok(file.sync_all()?),
            None => Ok(()),
        }
    }

    /// Whether [`DataFile::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.handle().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{fields_offset, init_file, slot_offset};
    use crate::record;

    #[test]
    fn slot_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        init_file(&path).unwrap();
        let file = DataFile::open(&path, true).unwrap();

        let rec = record(["Jones", "York", "Roofing", "2", "$10", "77"]);
        file.write_slot(slot_offset(0), SlotFlag::Valid, &rec).unwrap();
        assert_eq!(file.len().unwrap(), slot_offset(1));
        assert_eq!(file.read_flag(slot_offset(0)).unwrap(), 0x00);
        assert_eq!(file.read_record(fields_offset(0)).unwrap(), rec);

        file.write_flag(slot_offset(0), SlotFlag::Deleted).unwrap();
        assert_eq!(file.read_flag(slot_offset(0)).unwrap(), 0xFF);
    }

    #[test]
    fn closed_file_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        init_file(&path).unwrap();
        let file = DataFile::open(&path, false).unwrap();
        file.close().unwrap();
        assert!(file.is_closed());
        assert!(matches!(file.len(), Err(DbError::Closed)));
        file.close().unwrap();
    }
}
