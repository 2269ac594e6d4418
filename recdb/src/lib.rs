#![deny(missing_docs)]
#![doc = "recdb server assembly: opens the store, layers lock expiry on top and serves it over TCP."]

pub mod config;

use std::sync::Arc;

use anyhow::Result;
use recdb_storage::{LeasedStore, RecordAccess, Store};
use recdb_wire::RecordServer;
use tracing::info;

pub use config::Options;

/// The store as served: bare, or with locks that expire.
pub enum Backend {
    /// Locks are held until released.
    Plain(Arc<Store>),
    /// Locks are released automatically after the configured lease.
    Leased(Arc<LeasedStore>),
}

impl Backend {
    /// Open the database file named by `options`. Must run inside a tokio
    /// runtime when lock expiry is enabled.
    pub fn open(options: &Options) -> Result<Self> {
        let store = Arc::new(Store::open_with(&options.path, &options.store_config())?);
        Ok(match options.lock_timeout() {
            Some(timeout) => Backend::Leased(Arc::new(LeasedStore::new(store, timeout)?)),
            None => Backend::Plain(store),
        })
    }

    /// Shared handle for the network layer.
    pub fn access(&self) -> Arc<dyn RecordAccess> {
        match self {
            Backend::Plain(store) => Arc::clone(store) as Arc<dyn RecordAccess>,
            Backend::Leased(leased) => Arc::clone(leased) as Arc<dyn RecordAccess>,
        }
    }

    /// Close the store, stopping lock expiry first.
    pub async fn close(&self) -> Result<()> {
        match self {
            Backend::Plain(store) => store.close()?,
            Backend::Leased(leased) => leased.close().await?,
        }
        Ok(())
    }
}

/// A started server together with the store it serves.
pub struct Running {
    server: RecordServer,
    backend: Backend,
    port: u16,
}

impl Running {
    /// Bound TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The network server.
    pub fn server(&self) -> &RecordServer {
        &self.server
    }

    /// Stop accepting, drop clients, then close the store.
    pub async fn shutdown(self) -> Result<()> {
        self.server.stop().await;
        self.backend.close().await?;
        info!("recdb shut down");
        Ok(())
    }
}

/// Open the store and start serving it.
pub async fn start(options: &Options) -> Result<Running> {
    let backend = Backend::open(options)?;
    let server = RecordServer::new(backend.access(), options.server_config());
    let port = match server.start(options.port).await {
        Ok(port) => port,
        Err(e) => {
            backend.close().await?;
            return Err(e);
        }
    };
    Ok(Running {
        server,
        backend,
        port,
    })
}
