//! Command and response envelopes plus length-prefixed framing.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON document. A
//! client writes one [`Command`] and reads back exactly one [`Response`].

use std::io;

use bytes::{BufMut, BytesMut};
use recdb_storage::{Cookie, Criteria, DbError, ErrorKind, RecNo, Record, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// One operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Record numbers of valid records matching every non-null prefix.
    Find { criteria: Criteria },
    /// Store a new record, reusing a deleted slot when one exists.
    Add { record: Record },
    /// Fetch one valid record.
    Read { rec_no: RecNo },
    /// Mark a record deleted; `cookie` must hold its lock.
    Delete { rec_no: RecNo, cookie: Cookie },
    /// Overwrite a record in place; `cookie` must hold its lock.
    Modify { rec_no: RecNo, cookie: Cookie, record: Record },
    /// Wait for the record's lock and return a fresh cookie.
    Lock { rec_no: RecNo },
    /// Release a lock held under `cookie`.
    Unlock { rec_no: RecNo, cookie: Cookie },
}

impl Command {
    /// Operation tag, as it appears on the wire.
    pub fn op(&self) -> &'static str {
        match self {
            Command::Find { .. } => "FIND",
            Command::Add { .. } => "ADD",
            Command::Read { .. } => "READ",
            Command::Delete { .. } => "DELETE",
            Command::Modify { .. } => "MODIFY",
            Command::Lock { .. } => "LOCK",
            Command::Unlock { .. } => "UNLOCK",
        }
    }
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Payload {
    /// No value: DELETE, MODIFY and UNLOCK.
    Void,
    /// Number assigned by ADD.
    RecNo(RecNo),
    /// Matches from FIND, ascending.
    RecNos(Vec<RecNo>),
    /// Fields returned by READ.
    Record(Record),
    /// Cookie granted by LOCK.
    Cookie(Cookie),
}

/// Error carried back to the client; rebuilt into the same [`DbError`] kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub rec_no: Option<RecNo>,
    pub message: String,
}

impl From<&DbError> for WireError {
    fn from(err: &DbError) -> Self {
        Self {
            kind: err.kind(),
            rec_no: err.rec_no(),
            message: err.detail(),
        }
    }
}

impl From<WireError> for DbError {
    fn from(err: WireError) -> Self {
        DbError::from_parts(err.kind, err.rec_no, err.message)
    }
}

/// Reply to exactly one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The command succeeded.
    Ok { payload: Payload },
    /// The command failed with a store error.
    Error(WireError),
}

impl Response {
    /// Wrap the outcome of a command for sending.
    pub fn from_result(result: Result<Payload>) -> Self {
        match result {
            Ok(payload) => Response::Ok { payload },
            Err(err) => Response::Error(WireError::from(&err)),
        }
    }

    /// Unwrap a received reply, rebuilding the error kind on failure.
    pub fn into_result(self) -> Result<Payload> {
        match self {
            Response::Ok { payload } => Ok(payload),
            Response::Error(err) => Err(err.into()),
        }
    }
}

/// Read one frame. Returns `None` when the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Serialise `message` as JSON and write it as one frame.
pub async fn send<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    write_frame(writer, &data).await
}

/// Read one frame and decode it as JSON.
pub async fn recv<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
        None => Ok(None),
    }
}
