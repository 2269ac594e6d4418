//! recdb storage layer: a single file of fixed-width records.
//!
//! File layout:
//!
//! ```text
//! +-------------------------+
//! | magic 00 00 02 03       |
//! | field count (u16 BE)    |
//! | per field: name length, |
//! |   name, slot width      |
//! +-------------------------+
//! | flag | 182 field bytes  |  record 0
//! | flag | 182 field bytes  |  record 1
//! | ...                     |
//! +-------------------------+
//! ```
#![deny(missing_docs)]

pub mod access;
pub mod codec;
pub mod error;
pub mod file;
pub mod index;
pub mod lease;
pub mod store;

pub use access::RecordAccess;
pub use codec::{init_file, SlotFlag, HEADER_LEN, RECORD_WIDTH, SLOT_WIDTH};
pub use error::{DbError, ErrorKind, Result};
pub use lease::LeasedStore;
pub use recdb_lock::Cookie;
pub use store::{Store, StoreConfig};

/// Number of fields in every record.
pub const FIELD_COUNT: usize = 6;

/// Field names, in on-disk order.
pub const FIELD_NAMES: [&str; FIELD_COUNT] =
    ["name", "location", "specialties", "size", "rate", "owner"];

/// Slot width in bytes of each field, in on-disk order.
pub const FIELD_WIDTHS: [usize; FIELD_COUNT] = [32, 64, 64, 6, 8, 8];

/// Dense, zero-based record number.
pub type RecNo = u64;

/// Field values of one record, in schema order.
pub type Record = [String; FIELD_COUNT];

/// Search criteria: one optional prefix per field. `None` or an empty string
/// matches any value.
pub type Criteria = [Option<String>; FIELD_COUNT];

/// Build a [`Record`] from anything string-like.
pub fn record<S: Into<String>>(values: [S; FIELD_COUNT]) -> Record {
    values.map(Into::into)
}

/// Look up a field position by name.
pub fn field_position(name: &str) -> Option<usize> {
    FIELD_NAMES.iter().position(|&field| field == name)
}
