//! In-memory index of valid and deleted record numbers.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::codec::{slot_offset, SlotFlag, HEADER_LEN, SLOT_WIDTH};
use crate::error::{DbError, Result};
use crate::file::DataFile;
use crate::RecNo;

/// Valid and deleted record numbers, partitioning `[0, record_count)`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexSets {
    valid: BTreeSet<RecNo>,
    deleted: BTreeSet<RecNo>,
    record_count: u64,
}

impl IndexSets {
    /// Whether `rec_no` names a live record.
    pub fn is_valid(&self, rec_no: RecNo) -> bool {
        self.valid.contains(&rec_no)
    }

    /// Whether `rec_no` names a deleted slot.
    pub fn is_deleted(&self, rec_no: RecNo) -> bool {
        self.deleted.contains(&rec_no)
    }

    /// Slot the next create would use: the lowest deleted slot, or a new
    /// slot appended at the end.
    pub fn next_free(&self) -> RecNo {
        self.deleted
            .first()
            .copied()
            .unwrap_or(self.record_count)
    }

    /// Pick a slot, let `fill` write it, then mark it valid. The sets are
    /// left untouched when `fill` fails.
    pub fn allocate<E>(
        &mut self,
        fill: impl FnOnce(RecNo) -> std::result::Result<(), E>,
    ) -> std::result::Result<RecNo, E> {
        let rec_no = self.next_free();
        fill(rec_no)?;
        self.mark_valid(rec_no);
        Ok(rec_no)
    }

    /// Move `rec_no` into the valid set. Reusing a deleted slot leaves the
    /// record count untouched; a slot past the end extends it.
    pub fn mark_valid(&mut self, rec_no: RecNo) {
        if !self.deleted.remove(&rec_no) && rec_no >= self.record_count {
            self.record_count = rec_no + 1;
        }
        self.valid.insert(rec_no);
    }

    /// Move `rec_no` into the deleted set.
    pub fn mark_deleted(&mut self, rec_no: RecNo) {
        if !self.valid.remove(&rec_no) && rec_no >= self.record_count {
            self.record_count = rec_no + 1;
        }
        self.deleted.insert(rec_no);
    }

    /// Valid record numbers in ascending order.
    pub fn valid(&self) -> impl Iterator<Item = RecNo> + '_ {
        self.valid.iter().copied()
    }

    /// Number of slots in the file, valid and deleted.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Number of live records.
    pub fn valid_count(&self) -> usize {
        self.valid.len()
    }

    /// Number of deleted slots.
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    fn clear(&mut self) {
        self.valid.clear();
        self.deleted.clear();
        self.record_count = 0;
    }
}

/// In-memory index guarded by the structural lock.
///
/// Readers (existence checks, find) take the shared side; create, delete and
/// rebuild take the exclusive side.
#[derive(Debug, Default)]
pub struct Index {
    sets: RwLock<IndexSets>,
}

impl Index {
    /// Shared access to the sets.
    pub fn read(&self) -> RwLockReadGuard<'_, IndexSets> {
        self.sets.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the sets.
    pub fn write(&self) -> RwLockWriteGuard<'_, IndexSets> {
        self.sets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `rec_no` is valid.
    pub fn is_valid(&self, rec_no: RecNo) -> bool {
        self.read().is_valid(rec_no)
    }

    /// Snapshot of the valid record numbers, ascending.
    pub fn valid_snapshot(&self) -> Vec<RecNo> {
        self.read().valid().collect()
    }

    /// Number of slots, valid and deleted.
    pub fn record_count(&self) -> u64 {
        self.read().record_count()
    }

    /// Rescan every slot of `file` and rebuild the sets from the flag bytes.
    pub fn rebuild(&self, file: &DataFile) -> Result<()> {
        let mut sets = self.write();
        sets.clear();
        let data_len = file.len()?.saturating_sub(HEADER_LEN);
        let slot = SLOT_WIDTH as u64;
        if data_len % slot != 0 {
            return Err(DbError::CorruptFile(format!(
                "{} trailing bytes after the last record",
                data_len % slot
            )));
        }
        for rec_no in 0..data_len / slot {
            let byte = file.read_flag(slot_offset(rec_no))?;
            match SlotFlag::from_byte(byte) {
                Some(SlotFlag::Valid) => sets.mark_valid(rec_no),
                Some(SlotFlag::Deleted) => sets.mark_deleted(rec_no),
                None => {
                    sets.clear();
                    return Err(DbError::CorruptFile(format!(
                        "flag expected but {byte:#04x} found at record {rec_no}"
                    )));
                }
            }
        }
        debug!(
            valid = sets.valid_count(),
            deleted = sets.deleted_count(),
            "index rebuilt"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{init_file, slot_offset};
    use crate::record;
    use std::io::Write;

    fn take(sets: &mut IndexSets) -> RecNo {
        sets.allocate(|_| Ok::<_, DbError>(())).unwrap()
    }

    #[test]
    fn deleted_slot_reused_before_append() {
        let mut sets = IndexSets::default();
        assert_eq!(take(&mut sets), 0);
        assert_eq!(take(&mut sets), 1);
        assert_eq!(take(&mut sets), 2);
        sets.mark_deleted(1);
        assert_eq!(sets.record_count(), 3);
        assert_eq!(take(&mut sets), 1);
        assert_eq!(sets.record_count(), 3);
        assert_eq!(take(&mut sets), 3);
        assert_eq!(sets.record_count(), 4);
    }

    #[test]
    fn lowest_deleted_slot_wins() {
        let mut sets = IndexSets::default();
        for _ in 0..5 {
            take(&mut sets);
        }
        sets.mark_deleted(3);
        sets.mark_deleted(1);
        assert_eq!(sets.next_free(), 1);
        assert!(sets.is_deleted(3));
        assert_eq!(sets.valid().collect::<Vec<_>>(), vec![0, 2, 4]);
    }

    #[test]
    fn failed_fill_leaves_sets_alone() {
        let mut sets = IndexSets::default();
        take(&mut sets);
        let err = sets
            .allocate(|rec_no| Err(DbError::CorruptFile(format!("slot {rec_no}"))))
            .unwrap_err();
        assert!(matches!(err, DbError::CorruptFile(_)));
        assert_eq!(sets.record_count(), 1);
        assert_eq!(sets.next_free(), 1);
        assert!(!sets.is_valid(1));
    }

    #[test]
    fn rebuild_classifies_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        init_file(&path).unwrap();
        let file = DataFile::open(&path, false).unwrap();
        let rec = record(["a", "b", "c", "d", "e", "f"]);
        file.write_slot(slot_offset(0), SlotFlag::Valid, &rec).unwrap();
        file.write_slot(slot_offset(1), SlotFlag::Deleted, &rec).unwrap();
        file.write_slot(slot_offset(2), SlotFlag::Valid, &rec).unwrap();

        let index = Index::default();
        index.rebuild(&file).unwrap();
        assert_eq!(index.valid_snapshot(), vec![0, 2]);
        assert!(index.read().is_deleted(1));
        assert_eq!(index.record_count(), 3);
    }

    #[test]
    fn rebuild_rejects_unknown_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        init_file(&path).unwrap();
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&[0x07; SLOT_WIDTH]).unwrap();
        drop(raw);

        let file = DataFile::open(&path, false).unwrap();
        let err = Index::default().rebuild(&file).unwrap_err();
        assert!(matches!(err, DbError::CorruptFile(_)), "{err}");
    }

    #[test]
    fn rebuild_rejects_partial_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        init_file(&path).unwrap();
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&[0x00; 10]).unwrap();
        drop(raw);

        let file = DataFile::open(&path, false).unwrap();
        assert!(matches!(
            Index::default().rebuild(&file),
            Err(DbError::CorruptFile(_))
        ));
    }
}
