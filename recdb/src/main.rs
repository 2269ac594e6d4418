use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use recdb::Options;
use tokio::runtime::Runtime;
use tracing::{info, warn};

/// recdb record store.
#[derive(Parser)]
#[command(name = "recdb", author, version, about = "recdb record store server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a database file over TCP.
    Server(ServerArgs),

    /// Create an empty database file.
    Init {
        /// File to create; must not exist.
        path: PathBuf,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Database file (overrides the config).
    #[arg(long)]
    path: Option<PathBuf>,
    /// Listen port (overrides the config).
    #[arg(long)]
    port: Option<u16>,
    /// Lock lease in milliseconds; 0 disables expiry.
    #[arg(long)]
    lock_timeout_ms: Option<u64>,
    /// Prometheus exporter address.
    #[arg(long)]
    metrics_addr: Option<String>,
    /// Reject files whose schema section differs from the built-in layout.
    #[arg(long)]
    verify_schema: bool,
    /// Log filter directive.
    #[arg(long)]
    log_level: Option<String>,
}

impl ServerArgs {
    fn resolve(self) -> Result<Options> {
        let mut options = match &self.config {
            Some(path) => Options::load(path)?,
            None => Options::default(),
        };
        if let Some(path) = self.path {
            options.path = path;
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(ms) = self.lock_timeout_ms {
            options.lock_timeout_ms = ms;
        }
        if self.metrics_addr.is_some() {
            options.metrics_addr = self.metrics_addr;
        }
        if self.verify_schema {
            options.verify_schema = true;
        }
        if let Some(level) = self.log_level {
            options.log.level = level;
        }
        Ok(options)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { path } => {
            recdb_storage::init_file(&path)?;
            println!("created {}", path.display());
        }
        Commands::Server(args) => {
            let options = args.resolve()?;
            let _log = recdb_log::init(&options.log)?;
            // Start async runtime manually since main is sync.
            let rt = Runtime::new()?;
            rt.block_on(serve(options))?;
        }
    }
    Ok(())
}

async fn serve(options: Options) -> Result<()> {
    if let Some(addr) = &options.metrics_addr {
        recdb_metrics::serve(addr).await?;
    }
    let running = recdb::start(&options).await?;
    info!(path = %options.path.display(), port = running.port(), "recdb ready");
    println!("recdb listening on port {}", running.port());
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c; shutting down");
    }
    info!("shutdown requested");
    running.shutdown().await
}
