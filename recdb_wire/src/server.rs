//! TCP server exposing a [`RecordAccess`] to remote clients.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use recdb_metrics::{
    ACTIVE_CONNECTIONS, COMMANDS_TOTAL, COMMAND_ERRORS_TOTAL, COMMAND_LATENCY_SECS,
    CONNECTIONS_TOTAL,
};
use recdb_storage::RecordAccess;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::protocol::{read_frame, send, Command, Payload, Response, WireError};

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_host: String,
    /// How long one accept waits before the running flag is re-checked.
    pub accept_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            accept_timeout: Duration::from_millis(1000),
        }
    }
}

type Connections = Arc<Mutex<Vec<JoinHandle<()>>>>;

struct Tasks {
    acceptor: JoinHandle<()>,
    connections: Connections,
}

/// Accepts connections and serves one task per client.
pub struct RecordServer {
    access: Arc<dyn RecordAccess>,
    config: ServerConfig,
    running: Arc<AtomicBool>,
    port: AtomicU16,
    tasks: tokio::sync::Mutex<Option<Tasks>>,
}

impl RecordServer {
    pub fn new(access: Arc<dyn RecordAccess>, config: ServerConfig) -> Self {
        Self {
            access,
            config,
            running: Arc::new(AtomicBool::new(false)),
            port: AtomicU16::new(0),
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind `port` (0 picks an ephemeral port) and start accepting.
    /// Returns the bound port. Starting a running server is a no-op.
    pub async fn start(&self, port: u16) -> anyhow::Result<u16> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() && self.is_running() {
            return Ok(self.port.load(Ordering::SeqCst));
        }
        let listener = TcpListener::bind((self.config.bind_host.as_str(), port)).await?;
        let bound = listener.local_addr()?.port();
        self.port.store(bound, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let connections: Connections = Arc::default();
        let acceptor = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.access),
            Arc::clone(&self.running),
            Arc::clone(&connections),
            self.config.accept_timeout,
        ));
        *tasks = Some(Tasks {
            acceptor,
            connections,
        });
        info!(host = %self.config.bind_host, port = bound, "record server listening");
        Ok(bound)
    }

    /// Stop accepting, wait for the accept loop to notice, then drop every
    /// open connection.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = tasks.acceptor.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        let open: Vec<_> = tasks
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for conn in open {
            conn.abort();
        }
        info!(port = self.port.load(Ordering::SeqCst), "record server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound port while running.
    pub fn active_port(&self) -> Option<u16> {
        self.is_running().then(|| self.port.load(Ordering::SeqCst))
    }
}

async fn accept_loop(
    listener: TcpListener,
    access: Arc<dyn RecordAccess>,
    running: Arc<AtomicBool>,
    connections: Connections,
    accept_timeout: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let Some((socket, peer)) = accept_within(listener.accept(), accept_timeout).await else {
            continue;
        };
        info!(%peer, "client connected");
        CONNECTIONS_TOTAL.inc();
        let access = Arc::clone(&access);
        let conn = tokio::spawn(async move {
            let _active = ActiveConnection::open();
            match handle_conn(socket, peer, access).await {
                Ok(()) => info!(%peer, "client disconnected"),
                Err(e) => warn!(%peer, error = %e, "connection error"),
            }
        });
        let mut open = connections.lock().unwrap_or_else(PoisonError::into_inner);
        open.retain(|c| !c.is_finished());
        open.push(conn);
    }
    running.store(false, Ordering::SeqCst);
    debug!("accept loop exited");
}

/// Wait up to `accept_timeout` for one accept. A failed accept sleeps for the
/// same interval before returning.
async fn accept_within<T, F>(accept: F, accept_timeout: Duration) -> Option<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(accept_timeout, accept).await {
        Err(_) => None,
        Ok(Ok(accepted)) => Some(accepted),
        Ok(Err(e)) => {
            warn!(error = %e, "accept failed");
            tokio::time::sleep(accept_timeout).await;
            None
        }
    }
}

/// Keeps the active-connections gauge right even when the task is aborted.
struct ActiveConnection;

impl ActiveConnection {
    fn open() -> Self {
        ACTIVE_CONNECTIONS.inc();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.dec();
    }
}

/// Serve commands until the client hangs up. A command that fails to decode
/// is answered with a transport error; only socket failures end the session.
#[instrument(skip(socket, access))]
async fn handle_conn(
    mut socket: TcpStream,
    peer: SocketAddr,
    access: Arc<dyn RecordAccess>,
) -> io::Result<()> {
    socket.set_nodelay(true)?;
    while let Some(frame) = read_frame(&mut socket).await? {
        let response = match serde_json::from_slice::<Command>(&frame) {
            Ok(command) => execute(access.as_ref(), command).await,
            Err(e) => {
                warn!(error = %e, "malformed command");
                Response::Error(WireError {
                    kind: recdb_storage::ErrorKind::Transport,
                    rec_no: None,
                    message: format!("malformed command: {e}"),
                })
            }
        };
        send(&mut socket, &response).await?;
    }
    Ok(())
}

/// Run one command against `access` and package the outcome.
pub async fn execute(access: &dyn RecordAccess, command: Command) -> Response {
    let op = command.op();
    let start = Instant::now();
    let result = match command {
        Command::Find { criteria } => access.find(criteria).await.map(Payload::RecNos),
        Command::Add { record } => access.create(record).await.map(Payload::RecNo),
        Command::Read { rec_no } => access.read(rec_no).await.map(Payload::Record),
        Command::Delete { rec_no, cookie } => {
            access.delete(rec_no, cookie).await.map(|()| Payload::Void)
        }
        Command::Modify {
            rec_no,
            cookie,
            record,
        } => access.update(rec_no, record, cookie).await.map(|()| Payload::Void),
        Command::Lock { rec_no } => access.lock(rec_no).await.map(Payload::Cookie),
        Command::Unlock { rec_no, cookie } => {
            access.unlock(rec_no, cookie).await.map(|()| Payload::Void)
        }
    };
    COMMANDS_TOTAL.with_label_values(&[op]).inc();
    COMMAND_LATENCY_SECS.observe(start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        COMMAND_ERRORS_TOTAL.with_label_values(&[e.kind().as_str()]).inc();
        if e.is_fatal() {
            error!(op, error = %e, "store failure");
        } else {
            debug!(op, error = %e, "command failed");
        }
    }
    Response::from_result(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteStore;
    use crate::protocol::{read_frame, write_frame};
    use recdb_storage::{init_file, record, DbError, Store};

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_host: "127.0.0.1".into(),
            accept_timeout: Duration::from_millis(50),
        }
    }

    async fn serve(dir: &tempfile::TempDir) -> (RecordServer, u16) {
        let path = dir.path().join("db");
        init_file(&path).unwrap();
        let store: Arc<dyn RecordAccess> = Arc::new(Store::open(&path).unwrap());
        let server = RecordServer::new(store, test_config());
        let port = server.start(0).await.unwrap();
        (server, port)
    }

    fn sample(name: &str) -> recdb_storage::Record {
        record([name, "Smallville", "Roofing", "7", "$55.00", ""])
    }

    #[tokio::test]
    async fn remote_create_read_find() {
        let dir = tempfile::tempdir().unwrap();
        let (server, port) = serve(&dir).await;
        let client = RemoteStore::connect("127.0.0.1", port).await.unwrap();

        let a = client.create(sample("Buonarotti")).await.unwrap();
        let b = client.create(sample("Dogs With Tools")).await.unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(client.read(b).await.unwrap(), sample("Dogs With Tools"));

        let mut criteria: recdb_storage::Criteria = Default::default();
        criteria[0] = Some("Dogs".into());
        assert_eq!(client.find(criteria).await.unwrap(), vec![1]);
        server.stop().await;
    }

    #[tokio::test]
    async fn error_kinds_survive_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let (server, port) = serve(&dir).await;
        let client = RemoteStore::connect("127.0.0.1", port).await.unwrap();

        assert!(matches!(client.read(42).await, Err(DbError::RecordNotFound(42))));
        let rec_no = client.create(sample("Fred")).await.unwrap();
        assert!(matches!(
            client.delete(rec_no, 99).await,
            Err(DbError::InvalidCookie(n)) if n == rec_no
        ));
        // The session survives business errors.
        assert_eq!(client.read(rec_no).await.unwrap(), sample("Fred"));
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lock_excludes_other_clients() {
        let dir = tempfile::tempdir().unwrap();
        let (server, port) = serve(&dir).await;
        let first = Arc::new(RemoteStore::connect("127.0.0.1", port).await.unwrap());
        let second = Arc::new(RemoteStore::connect("127.0.0.1", port).await.unwrap());

        let rec_no = first.create(sample("Moore")).await.unwrap();
        let cookie = first.lock(rec_no).await.unwrap();
        let waiter = {
            let second = Arc::clone(&second);
            tokio::spawn(async move { second.lock(rec_no).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        first.unlock(rec_no, cookie).await.unwrap();
        let next = waiter.await.unwrap().unwrap();
        assert_ne!(next, cookie);
        second.update(rec_no, sample("Moore Bros"), next).await.unwrap();
        second.unlock(rec_no, next).await.unwrap();
        assert_eq!(first.read(rec_no).await.unwrap(), sample("Moore Bros"));
        server.stop().await;
    }

    #[tokio::test]
    async fn malformed_command_gets_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let (server, port) = serve(&dir).await;
        let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        write_frame(&mut socket, b"{\"op\":\"EXPLODE\"}").await.unwrap();
        let frame = read_frame(&mut socket).await.unwrap().unwrap();
        let response: Response = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(response.into_result(), Err(DbError::Transport(_))));

        send(&mut socket, &Command::Read { rec_no: 0 }).await.unwrap();
        let frame = read_frame(&mut socket).await.unwrap().unwrap();
        let response: Response = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(response.into_result(), Err(DbError::RecordNotFound(0))));
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_drops_clients_and_frees_state() {
        let dir = tempfile::tempdir().unwrap();
        let (server, port) = serve(&dir).await;
        assert!(server.is_running());
        assert_eq!(server.active_port(), Some(port));
        let client = RemoteStore::connect("127.0.0.1", port).await.unwrap();
        client.create(sample("Ada")).await.unwrap();

        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.active_port(), None);
        assert!(matches!(client.read(0).await, Err(DbError::Transport(_))));
        // Stopping twice is harmless.
        server.stop().await;
    }

    #[tokio::test]
    async fn failed_accept_backs_off() {
        let wait = Duration::from_millis(50);
        let start = Instant::now();
        let accepted: Option<()> = accept_within(
            async { Err(io::Error::new(io::ErrorKind::Other, "too many open files")) },
            wait,
        )
        .await;
        assert!(accepted.is_none());
        assert!(start.elapsed() >= wait);
    }

    #[tokio::test]
    async fn execute_without_a_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        init_file(&path).unwrap();
        let store = Store::open(&path).unwrap();

        let added = execute(&store, Command::Add { record: sample("Kim") }).await;
        assert_eq!(added, Response::Ok { payload: Payload::RecNo(0) });
        let missing = execute(&store, Command::Unlock { rec_no: 0, cookie: 1 }).await;
        assert!(matches!(missing.into_result(), Err(DbError::InvalidCookie(0))));
    }
}
