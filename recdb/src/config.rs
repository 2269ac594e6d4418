//! Server configuration file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use recdb_log::LogConfig;
use recdb_storage::StoreConfig;
use recdb_wire::ServerConfig;
use serde::{Deserialize, Serialize};

/// Server options, read from YAML. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Database file.
    pub path: PathBuf,
    /// Interface to listen on.
    pub host: String,
    /// TCP port; 0 picks an ephemeral one.
    pub port: u16,
    /// Locks are released this long after being granted; 0 disables expiry.
    pub lock_timeout_ms: u64,
    /// Accept poll interval.
    pub accept_timeout_ms: u64,
    /// Compare the file's schema section with the built-in layout on open.
    pub verify_schema: bool,
    /// Sync data to disk after every write.
    pub sync_writes: bool,
    /// Address for the Prometheus exporter, e.g. `127.0.0.1:9100`.
    pub metrics_addr: Option<String>,
    /// Logging.
    pub log: LogConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            path: PathBuf::from("db.rec"),
            host: "0.0.0.0".into(),
            port: 8080,
            lock_timeout_ms: 5000,
            accept_timeout_ms: 1000,
            verify_schema: false,
            sync_writes: false,
            metrics_addr: None,
            log: LogConfig::default(),
        }
    }
}

impl Options {
    /// Read options from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let options = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(options)
    }

    /// Write options as YAML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Lock lease, or `None` when locks never expire.
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }

    /// Settings for the storage layer.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            verify_schema: self.verify_schema,
            sync_writes: self.sync_writes,
        }
    }

    /// Settings for the network layer.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_host: self.host.clone(),
            accept_timeout: Duration::from_millis(self.accept_timeout_ms.max(1)),
        }
    }
}
