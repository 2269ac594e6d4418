//! Automatic release of forgotten record locks.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use recdb_lock::Cookie;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::access::RecordAccess;
use crate::error::{DbError, Result};
use crate::store::Store;
use crate::{Criteria, RecNo, Record};

#[derive(Debug)]
struct Lease {
    rec_no: RecNo,
    cookie: Cookie,
    expires_at: Instant,
}

/// A [`Store`] whose locks expire `timeout` after they are granted.
///
/// Every successful lock queues a lease; a single background task releases
/// each lease when it falls due. A lease whose cookie was already released
/// fails with `InvalidCookie`, which is expected and only logged. Must be
/// created inside a tokio runtime.
pub struct LeasedStore {
    store: Arc<Store>,
    timeout: Duration,
    leases: mpsc::UnboundedSender<Lease>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LeasedStore {
    /// Wrap `store`, expiring locks after `timeout`.
    pub fn new(store: Arc<Store>, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(DbError::InvalidArgument(
                "lock timeout must be greater than zero".into(),
            ));
        }
        let (leases, queue) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let worker = tokio::spawn(expire_leases(
            Arc::clone(&store),
            queue,
            Arc::clone(&shutdown),
        ));
        info!(timeout_ms = timeout.as_millis() as u64, "auto-unlock enabled");
        Ok(Self {
            store,
            timeout,
            leases,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn grant(&self, rec_no: RecNo, cookie: Cookie) {
        let lease = Lease {
            rec_no,
            cookie,
            expires_at: Instant::now() + self.timeout,
        };
        if self.leases.send(lease).is_err() {
            warn!(rec_no, "lease worker gone; lock will not expire");
        }
    }

    /// Stop the lease worker and close the wrapped store.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.notify_one();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "lease worker ended abnormally");
            }
        }
        self.store.close()
    }
}

impl Drop for LeasedStore {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
        }
    }
}

async fn expire_leases(
    store: Arc<Store>,
    mut queue: mpsc::UnboundedReceiver<Lease>,
    shutdown: Arc<Notify>,
) {
    loop {
        let lease = tokio::select! {
            _ = shutdown.notified() => break,
            next = queue.recv() => match next {
                Some(lease) => lease,
                None => break,
            },
        };
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep_until(lease.expires_at) => {}
        }
        match store.unlock(lease.rec_no, lease.cookie) {
            Ok(()) => info!(
                rec_no = lease.rec_no,
                cookie = lease.cookie,
                "record auto-unlocked"
            ),
            Err(DbError::InvalidCookie(_)) => debug!(
                rec_no = lease.rec_no,
                cookie = lease.cookie,
                "lease expired after the lock was released"
            ),
            Err(err) => warn!(rec_no = lease.rec_no, error = %err, "auto-unlock failed"),
        }
    }
    debug!("lease worker stopped");
}

#[async_trait::async_trait]
impl RecordAccess for LeasedStore {
    async fn read(&self, rec_no: RecNo) -> Result<Record> {
        self.store.read(rec_no)
    }

    async fn update(&self, rec_no: RecNo, record: Record, cookie: Cookie) -> Result<()> {
        self.store.update(rec_no, &record, cookie)
    }

    async fn delete(&self, rec_no: RecNo, cookie: Cookie) -> Result<()> {
        self.store.delete(rec_no, cookie)
    }

    async fn find(&self, criteria: Criteria) -> Result<Vec<RecNo>> {
        self.store.find(&criteria)
    }

    async fn create(&self, record: Record) -> Result<RecNo> {
        self.store.create(&record)
    }

    async fn lock(&self, rec_no: RecNo) -> Result<Cookie> {
        let cookie = self.store.lock(rec_no).await?;
        self.grant(rec_no, cookie);
        Ok(cookie)
    }

    async fn unlock(&self, rec_no: RecNo, cookie: Cookie) -> Result<()> {
        self.store.unlock(rec_no, cookie)
    }
}
