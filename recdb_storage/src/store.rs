//! The record store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use recdb_lock::{Cookie, LockTable};
use tracing::{debug, error, info};

use crate::access::RecordAccess;
use crate::codec::{self, fields_offset, slot_offset, SlotFlag};
use crate::error::{DbError, Result};
use crate::file::DataFile;
use crate::index::Index;
use crate::{Criteria, RecNo, Record};

/// Options applied when opening a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// Compare the header's schema section with the built-in field table.
    pub verify_schema: bool,
    /// `sync_data` after every write.
    pub sync_writes: bool,
}

/// Record store over a single database file.
///
/// Composes the [`DataFile`], the [`Index`] and a [`LockTable`]. Structural
/// changes (create, delete) run under the index's exclusive lock together with
/// their file writes; updates rely on the record lock alone.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    file: DataFile,
    index: Index,
    locks: LockTable,
}

impl Store {
    /// Open the database file at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &StoreConfig::default())
    }

    /// Open the database file at `path`, validate its header and build the index.
    pub fn open_with<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = DataFile::open(&path, config.sync_writes)?;
        if let Err(err) = codec::check_header(&file, config.verify_schema) {
            error!(path = %path.display(), error = %err, "wrong data file format");
            return Err(err);
        }
        let index = Index::default();
        index.rebuild(&file)?;
        {
            let sets = index.read();
            info!(
                path = %path.display(),
                valid = sets.valid_count(),
                deleted = sets.deleted_count(),
                "record store opened"
            );
        }
        Ok(Self {
            path,
            file,
            index,
            locks: LockTable::new(),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of slots in the file, valid and deleted.
    pub fn record_count(&self) -> u64 {
        self.index.record_count()
    }

    /// Create a record, reusing the lowest deleted slot if there is one.
    pub fn create(&self, record: &Record) -> Result<RecNo> {
        let rec_no = self.index.write().allocate(|rec_no| {
            self.file
                .write_slot(slot_offset(rec_no), SlotFlag::Valid, record)
        })?;
        debug!(rec_no, "record created");
        Ok(rec_no)
    }

    /// Read a live record. No lock is needed.
    pub fn read(&self, rec_no: RecNo) -> Result<Record> {
        let sets = self.index.read();
        if !sets.is_valid(rec_no) {
            return Err(DbError::RecordNotFound(rec_no));
        }
        self.file.read_record(fields_offset(rec_no))
    }

    /// Overwrite the fields of a record locked with `cookie`.
    pub fn update(&self, rec_no: RecNo, record: &Record, cookie: Cookie) -> Result<()> {
        self.locks.check(rec_no, cookie)?;
        if !self.index.is_valid(rec_no) {
            return Err(DbError::RecordNotFound(rec_no));
        }
        // Not under the structural lock: readers without the record lock may
        // observe a partially written record.
        self.file.write_record(fields_offset(rec_no), record)?;
        debug!(rec_no, "record updated");
        Ok(())
    }

    /// Delete a record locked with `cookie`. The lock stays held until unlocked.
    pub fn delete(&self, rec_no: RecNo, cookie: Cookie) -> Result<()> {
        self.locks.check(rec_no, cookie)?;
        let mut sets = self.index.write();
        if !sets.is_valid(rec_no) {
            return Err(DbError::RecordNotFound(rec_no));
        }
        self.file
            .write_flag(slot_offset(rec_no), SlotFlag::Deleted)?;
        sets.mark_deleted(rec_no);
        debug!(rec_no, "record deleted");
        Ok(())
    }

    /// Record numbers of live records matching `criteria`, ascending.
    pub fn find(&self, criteria: &Criteria) -> Result<Vec<RecNo>> {
        let mut found = Vec::new();
        for rec_no in self.index.valid_snapshot() {
            match self.read(rec_no) {
                Ok(record) if matches_criteria(&record, criteria) => found.push(rec_no),
                Ok(_) => {}
                Err(DbError::RecordNotFound(_)) => {
                    debug!(rec_no, "record deleted during find");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(found)
    }

    /// Lock a record, waiting while another caller holds it.
    pub async fn lock(&self, rec_no: RecNo) -> Result<Cookie> {
        let cookie = self
            .locks
            .lock(rec_no, || self.index.is_valid(rec_no))
            .await?;
        Ok(cookie)
    }

    /// Lock a record, giving up after `timeout`.
    pub async fn lock_timeout(&self, rec_no: RecNo, timeout: Duration) -> Result<Cookie> {
        let cookie = self
            .locks
            .lock_timeout(rec_no, timeout, || self.index.is_valid(rec_no))
            .await?;
        Ok(cookie)
    }

    /// Release a record lock.
    pub fn unlock(&self, rec_no: RecNo, cookie: Cookie) -> Result<()> {
        Ok(self.locks.unlock(rec_no, cookie)?)
    }

    /// Whether a record is currently locked.
    pub fn is_locked(&self, rec_no: RecNo) -> bool {
        self.locks.is_locked(rec_no)
    }

    /// Close the store: lock waiters are released with [`DbError::Closed`]
    /// and the file handle is flushed and dropped.
    pub fn close(&self) -> Result<()> {
        self.locks.close();
        self.file.close()?;
        info!(path = %self.path.display(), "record store closed");
        Ok(())
    }
}

/// Prefix match of every non-empty criterion against the same field.
pub fn matches_criteria(record: &Record, criteria: &Criteria) -> bool {
    record
        .iter()
        .zip(criteria.iter())
        .all(|(value, criterion)| match criterion.as_deref() {
            None | Some("") => true,
            Some(prefix) => value.as_bytes().starts_with(prefix.as_bytes()),
        })
}

#[async_trait::async_trait]
impl RecordAccess for Store {
    async fn read(&self, rec_no: RecNo) -> Result<Record> {
        Store::read(self, rec_no)
    }

    async fn update(&self, rec_no: RecNo, record: Record, cookie: Cookie) -> Result<()> {
        Store::update(self, rec_no, &record, cookie)
    }

    async fn delete(&self, rec_no: RecNo, cookie: Cookie) -> Result<()> {
        Store::delete(self, rec_no, cookie)
    }

    async fn find(&self, criteria: Criteria) -> Result<Vec<RecNo>> {
        Store::find(self, &criteria)
    }

    async fn create(&self, record: Record) -> Result<RecNo> {
        Store::create(self, &record)
    }

    async fn lock(&self, rec_no: RecNo) -> Result<Cookie> {
        Store::lock(self, rec_no).await
    }

    async fn unlock(&self, rec_no: RecNo, cookie: Cookie) -> Result<()> {
        Store::unlock(self, rec_no, cookie)
    }
}
