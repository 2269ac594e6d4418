//! Network access to a record store.
//!
//! The protocol is request/response over TCP: each message is a 4-byte
//! big-endian length followed by a JSON body. [`RecordServer`] serves any
//! [`recdb_storage::RecordAccess`]; [`RemoteStore`] implements the same trait
//! on top of a connection, so callers cannot tell a remote store from a local
//! one except by the `Transport` error kind.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RemoteStore;
pub use protocol::{Command, Payload, Response, WireError, MAX_FRAME_LEN};
pub use server::{execute, RecordServer, ServerConfig};
