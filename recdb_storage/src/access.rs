//! Trait implemented by local and remote record stores.

use recdb_lock::Cookie;

use crate::error::Result;
use crate::{Criteria, RecNo, Record};

/// Operations offered by a record store, whether local or reached over the wire.
#[async_trait::async_trait]
pub trait RecordAccess: Send + Sync {
    /// Read a live record.
    async fn read(&self, rec_no: RecNo) -> Result<Record>;

    /// Overwrite the fields of a record locked with `cookie`.
    async fn update(&self, rec_no: RecNo, record: Record, cookie: Cookie) -> Result<()>;

    /// Delete a record locked with `cookie`, freeing its slot for reuse.
    async fn delete(&self, rec_no: RecNo, cookie: Cookie) -> Result<()>;

    /// Record numbers whose fields start with the given prefixes.
    async fn find(&self, criteria: Criteria) -> Result<Vec<RecNo>>;

    /// Create a record, possibly reusing a deleted slot.
    async fn create(&self, record: Record) -> Result<RecNo>;

    /// Lock a record, waiting while someone else holds it.
    async fn lock(&self, rec_no: RecNo) -> Result<Cookie>;

    /// Release a record lock.
    async fn unlock(&self, rec_no: RecNo, cookie: Cookie) -> Result<()>;
}
