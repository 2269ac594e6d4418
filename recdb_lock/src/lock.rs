//! Per-record lock table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::cookie::{Cookie, CookieSource};

/// Lock table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The record is not in the valid set at acquisition time.
    #[error("record {0} not found")]
    RecordNotFound(u64),
    /// No lock is held on the record, or it is held under another cookie.
    #[error("invalid lock cookie for record {0}")]
    InvalidCookie(u64),
    /// The lock was not granted within the caller's deadline.
    #[error("timed out waiting for lock on record {0}")]
    Timeout(u64),
    /// The table was closed while the caller was waiting.
    #[error("lock table closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Holder {
    cookie: Option<Cookie>,
    last: Option<Cookie>,
}

/// Wait object for one record number. Shared by every caller touching that
/// record and kept for the lifetime of the table.
#[derive(Debug, Default)]
struct RecordLock {
    holder: Mutex<Holder>,
    released: Notify,
}

impl RecordLock {
    fn holder(&self) -> MutexGuard<'_, Holder> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive advisory locks keyed by record number.
///
/// A lock is owned by whoever presents the cookie returned from [`LockTable::lock`].
/// Waiters park on a per-record [`Notify`], so releasing one record never wakes
/// callers waiting on another.
#[derive(Debug, Default)]
pub struct LockTable {
    records: Mutex<HashMap<u64, Arc<RecordLock>>>,
    cookies: CookieSource,
    closed: AtomicBool,
}

impl LockTable {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<u64, Arc<RecordLock>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, rec_no: u64) -> Arc<RecordLock> {
        Arc::clone(self.records().entry(rec_no).or_default())
    }

    fn existing(&self, rec_no: u64) -> Option<Arc<RecordLock>> {
        self.records().get(&rec_no).cloned()
    }

    /// Acquire the lock on `rec_no`, waiting while another caller holds it.
    ///
    /// `exists` is consulted once the record is free; returning `false` fails
    /// the call with [`LockError::RecordNotFound`]. Dropping the returned
    /// future abandons the wait.
    pub async fn lock<F>(&self, rec_no: u64, exists: F) -> Result<Cookie, LockError>
    where
        F: Fn() -> bool,
    {
        let record = match self.existing(rec_no) {
            Some(record) => record,
            None if !exists() => return Err(LockError::RecordNotFound(rec_no)),
            None => self.record(rec_no),
        };
        loop {
            let released = record.released.notified();
            tokio::pin!(released);
            // Register before inspecting the holder so a release in between is not lost.
            released.as_mut().enable();
            if self.is_closed() {
                return Err(LockError::Closed);
            }
            let vanished = {
                let mut holder = record.holder();
                if holder.cookie.is_none() {
                    if exists() {
                        let cookie = self.cookies.next_after(holder.last);
                        holder.cookie = Some(cookie);
                        holder.last = Some(cookie);
                        debug!(rec_no, cookie, "record locked");
                        return Ok(cookie);
                    }
                    true
                } else {
                    false
                }
            };
            if vanished {
                self.forget_idle(rec_no, &record);
                return Err(LockError::RecordNotFound(rec_no));
            }
            debug!(rec_no, "record busy, waiting for release");
            released.await;
        }
    }

    /// Drop the wait object of a record that no longer exists, unless someone
    /// holds it or is waiting on it.
    fn forget_idle(&self, rec_no: u64, record: &Arc<RecordLock>) {
        let mut records = self.records();
        let ours = records
            .get(&rec_no)
            .is_some_and(|entry| Arc::ptr_eq(entry, record));
        // One reference in the map, one held by the caller.
        if ours && Arc::strong_count(record) == 2 && record.holder().cookie.is_none() {
            records.remove(&rec_no);
        }
    }

    /// Like [`LockTable::lock`] but gives up after `timeout`.
    pub async fn lock_timeout<F>(
        &self,
        rec_no: u64,
        timeout: Duration,
        exists: F,
    ) -> Result<Cookie, LockError>
    where
        F: Fn() -> bool,
    {
        tokio::time::timeout(timeout, self.lock(rec_no, exists))
            .await
            .map_err(|_| LockError::Timeout(rec_no))?
    }

    /// Release the lock on `rec_no` and wake the callers waiting for it.
    pub fn unlock(&self, rec_no: u64, cookie: Cookie) -> Result<(), LockError> {
        let record = self
            .existing(rec_no)
            .ok_or(LockError::InvalidCookie(rec_no))?;
        {
            let mut holder = record.holder();
            if holder.cookie != Some(cookie) {
                return Err(LockError::InvalidCookie(rec_no));
            }
            holder.cookie = None;
        }
        record.released.notify_waiters();
        debug!(rec_no, cookie, "record unlocked");
        Ok(())
    }

    /// Verify that `cookie` currently holds the lock on `rec_no`.
    pub fn check(&self, rec_no: u64, cookie: Cookie) -> Result<(), LockError> {
        let held = self
            .existing(rec_no)
            .and_then(|record| record.holder().cookie);
        if held == Some(cookie) {
            Ok(())
        } else {
            Err(LockError::InvalidCookie(rec_no))
        }
    }

    /// Whether any caller currently holds the lock on `rec_no`.
    pub fn is_locked(&self, rec_no: u64) -> bool {
        self.existing(rec_no)
            .map(|record| record.holder().cookie.is_some())
            .unwrap_or(false)
    }

    /// Number of records currently locked.
    pub fn locked_count(&self) -> usize {
        self.records()
            .values()
            .filter(|record| record.holder().cookie.is_some())
            .count()
    }

    /// Close the table: every pending and future `lock` fails with [`LockError::Closed`].
    pub fn close(&self) {
        debug!(
            held = self.locked_count(),
            issued = self.cookies.issued(),
            "closing lock table"
        );
        self.closed.store(true, Ordering::SeqCst);
        for record in self.records().values() {
            record.released.notify_waiters();
        }
    }

    /// Whether [`LockTable::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn lock_check_unlock() {
        let table = LockTable::new();
        let cookie = table.lock(3, || true).await.unwrap();
        assert!(table.is_locked(3));
        table.check(3, cookie).unwrap();
        table.unlock(3, cookie).unwrap();
        assert!(!table.is_locked(3));
        assert_eq!(table.check(3, cookie), Err(LockError::InvalidCookie(3)));
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let table = LockTable::new();
        assert_eq!(table.lock(9, || false).await, Err(LockError::RecordNotFound(9)));
        assert!(!table.is_locked(9));
    }

    #[tokio::test]
    async fn wrong_cookie_rejected() {
        let table = LockTable::new();
        let c1 = table.lock(1, || true).await.unwrap();
        let c2 = table.lock(2, || true).await.unwrap();
        assert_eq!(table.unlock(1, c2), Err(LockError::InvalidCookie(1)));
        assert_eq!(table.check(2, c1), Err(LockError::InvalidCookie(2)));
        assert_eq!(table.unlock(7, c1), Err(LockError::InvalidCookie(7)));
        assert!(table.is_locked(1));
        assert_eq!(table.locked_count(), 2);
    }

    #[tokio::test]
    async fn relock_yields_fresh_cookie() {
        let table = LockTable::new();
        let first = table.lock(0, || true).await.unwrap();
        table.unlock(0, first).unwrap();
        let second = table.lock(0, || true).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_locker_waits_for_release() {
        let table = Arc::new(LockTable::new());
        let cookie = table.lock(5, || true).await.unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.lock(5, || true).await })
        };
        tokio::time::sleep(SHORT).await;
        assert!(!waiter.is_finished());

        table.unlock(5, cookie).unwrap();
        let next = waiter.await.unwrap().unwrap();
        assert_ne!(next, cookie);
        table.check(5, next).unwrap();
    }

    #[tokio::test]
    async fn release_does_not_wake_other_records() {
        let table = LockTable::new();
        let c1 = table.lock(1, || true).await.unwrap();
        let c2 = table.lock(2, || true).await.unwrap();

        let other = table.existing(2).unwrap();
        let woken = other.released.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();

        table.unlock(1, c1).unwrap();
        assert!(tokio::time::timeout(SHORT, woken.as_mut()).await.is_err());

        table.unlock(2, c2).unwrap();
        assert!(tokio::time::timeout(SHORT, woken.as_mut()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_records_leave_no_wait_objects() {
        let table = LockTable::new();
        for n in 0..10_000u64 {
            assert_eq!(
                table.lock(u64::MAX - n, || false).await,
                Err(LockError::RecordNotFound(u64::MAX - n))
            );
        }
        assert_eq!(table.records().len(), 0);
    }

    #[tokio::test]
    async fn wait_object_dropped_when_record_vanishes() {
        let table = Arc::new(LockTable::new());
        let exists = Arc::new(AtomicBool::new(true));
        let cookie = table.lock(11, || true).await.unwrap();
        let waiter = {
            let table = Arc::clone(&table);
            let exists = Arc::clone(&exists);
            tokio::spawn(async move { table.lock(11, || exists.load(Ordering::SeqCst)).await })
        };
        tokio::time::sleep(SHORT).await;
        exists.store(false, Ordering::SeqCst);
        table.unlock(11, cookie).unwrap();
        assert_eq!(waiter.await.unwrap(), Err(LockError::RecordNotFound(11)));
        assert!(table.existing(11).is_none());
    }

    #[tokio::test]
    async fn wait_times_out() {
        let table = LockTable::new();
        let _cookie = table.lock(4, || true).await.unwrap();
        assert_eq!(
            table.lock_timeout(4, SHORT, || true).await,
            Err(LockError::Timeout(4))
        );
    }

    #[tokio::test]
    async fn record_deleted_while_waiting() {
        let table = Arc::new(LockTable::new());
        let exists = Arc::new(AtomicBool::new(true));
        let cookie = table.lock(6, || true).await.unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            let exists = Arc::clone(&exists);
            tokio::spawn(async move { table.lock(6, || exists.load(Ordering::SeqCst)).await })
        };
        tokio::time::sleep(SHORT).await;
        exists.store(false, Ordering::SeqCst);
        table.unlock(6, cookie).unwrap();
        assert_eq!(waiter.await.unwrap(), Err(LockError::RecordNotFound(6)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_wakes_waiters() {
        let table = Arc::new(LockTable::new());
        let _cookie = table.lock(8, || true).await.unwrap();
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.lock(8, || true).await })
        };
        tokio::time::sleep(SHORT).await;
        table.close();
        assert_eq!(waiter.await.unwrap(), Err(LockError::Closed));
        assert_eq!(table.lock(10, || true).await, Err(LockError::Closed));
    }
}
