//! Client side of the record protocol.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use recdb_storage::{Cookie, Criteria, DbError, RecNo, Record, RecordAccess, Result};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::protocol::{recv, send, Command, Payload, Response};

/// A [`RecordAccess`] that forwards every call to a remote server over one
/// connection. Calls from several tasks are serialised on that connection.
#[derive(Debug)]
pub struct RemoteStore {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
    // Set while a request is outstanding; still set at the start of a call
    // means an earlier call was cancelled mid-exchange.
    in_flight: AtomicBool,
}

impl RemoteStore {
    #[instrument]
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await.map_err(transport)?;
        stream.set_nodelay(true).map_err(transport)?;
        let peer = stream.peer_addr().map_err(transport)?;
        debug!(%peer, "connected to record server");
        Ok(Self {
            peer,
            stream: Mutex::new(stream),
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn call(&self, command: Command) -> Result<Payload> {
        let mut stream = self.stream.lock().await;
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(DbError::Transport(
                "connection out of step after an abandoned request".into(),
            ));
        }
        send(&mut *stream, &command).await.map_err(transport)?;
        let response: Response = recv(&mut *stream)
            .await
            .map_err(transport)?
            .ok_or_else(|| DbError::Transport("server closed the connection".into()))?;
        self.in_flight.store(false, Ordering::SeqCst);
        response.into_result()
    }
}

fn transport(err: io::Error) -> DbError {
    DbError::Transport(err.to_string())
}

fn unexpected(op: &str, payload: Payload) -> DbError {
    DbError::Transport(format!("unexpected {payload:?} in reply to {op}"))
}

#[async_trait]
impl RecordAccess for RemoteStore {
    async fn read(&self, rec_no: RecNo) -> Result<Record> {
        match self.call(Command::Read { rec_no }).await? {
            Payload::Record(record) => Ok(record),
            other => Err(unexpected("READ", other)),
        }
    }

    async fn update(&self, rec_no: RecNo, record: Record, cookie: Cookie) -> Result<()> {
        match self
            .call(Command::Modify {
                rec_no,
                cookie,
                record,
            })
            .await?
        {
            Payload::Void => Ok(()),
            other => Err(unexpected("MODIFY", other)),
        }
    }

    async fn delete(&self, rec_no: RecNo, cookie: Cookie) -> Result<()> {
        match self.call(Command::Delete { rec_no, cookie }).await? {
            Payload::Void => Ok(()),
            other => Err(unexpected("DELETE", other)),
        }
    }

    async fn find(&self, criteria: Criteria) -> Result<Vec<RecNo>> {
        match self.call(Command::Find { criteria }).await? {
            Payload::RecNos(found) => Ok(found),
            other => Err(unexpected("FIND", other)),
        }
    }

    async fn create(&self, record: Record) -> Result<RecNo> {
        match self.call(Command::Add { record }).await? {
            Payload::RecNo(rec_no) => Ok(rec_no),
            other => Err(unexpected("ADD", other)),
        }
    }

    async fn lock(&self, rec_no: RecNo) -> Result<Cookie> {
        match self.call(Command::Lock { rec_no }).await? {
            Payload::Cookie(cookie) => Ok(cookie),
            other => Err(unexpected("LOCK", other)),
        }
    }

    async fn unlock(&self, rec_no: RecNo, cookie: Cookie) -> Result<()> {
        match self.call(Command::Unlock { rec_no, cookie }).await? {
            Payload::Void => Ok(()),
            other => Err(unexpected("UNLOCK", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_frame, write_frame};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn wrong_payload_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            while read_frame(&mut socket).await.unwrap().is_some() {
                let reply = serde_json::to_vec(&Response::Ok { payload: Payload::Void }).unwrap();
                write_frame(&mut socket, &reply).await.unwrap();
            }
        });

        let client = RemoteStore::connect("127.0.0.1", port).await.unwrap();
        assert!(matches!(client.read(0).await, Err(DbError::Transport(_))));
        client.unlock(0, 1).await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_call_poisons_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Read requests but never answer.
            while read_frame(&mut socket).await.unwrap().is_some() {}
        });

        let client = RemoteStore::connect("127.0.0.1", port).await.unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(50), client.lock(3)).await;
        assert!(abandoned.is_err());
        assert!(matches!(client.read(3).await, Err(DbError::Transport(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(matches!(
            RemoteStore::connect("127.0.0.1", port).await,
            Err(DbError::Transport(_))
        ));
    }
}
