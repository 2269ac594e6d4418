use clap::Parser;
use directories::BaseDirs;
use recdb_storage::{RecordAccess, FIELD_NAMES};
use recdb_wire::RemoteStore;
use rustyline::{error::ReadlineError, DefaultEditor};
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf};
use tokio::runtime::Runtime;

mod command;

use command::ShellCommand;

/// recdb command-line client.
#[derive(Parser)]
#[command(name = "recdbctl", author, version, about = "recdb client shell", long_about = None)]
struct Cli {
    /// Execute one command and exit.
    #[arg(short = 'e', long = "exec")]
    exec: Option<String>,

    /// Server host (overrides the config file).
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Path to configuration file (default: $HOME/.recdbrc).
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ClientConfig {
    host: String,
    port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8080,
        }
    }
}

impl ClientConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| BaseDirs::new().map(|b| b.home_dir().join(".recdbrc")));

    let mut config = match config_path {
        Some(cfg) if cfg.exists() => ClientConfig::load(&cfg)?,
        _ => ClientConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let rt = Runtime::new()?;
    let store = rt.block_on(RemoteStore::connect(&config.host, config.port))?;

    if let Some(line) = cli.exec {
        let cmd = command::parse(&line)?;
        if cmd != ShellCommand::Exit {
            println!("{}", rt.block_on(run(&store, cmd))?);
        }
        return Ok(());
    }

    interactive_shell(&rt, &store)
}

/// Execute one command and render its outcome.
async fn run(store: &dyn RecordAccess, cmd: ShellCommand) -> recdb_storage::Result<String> {
    Ok(match cmd {
        ShellCommand::Find(criteria) => {
            let found = store.find(criteria).await?;
            if found.is_empty() {
                "(no matches)".to_string()
            } else {
                found.iter().map(u64::to_string).collect::<Vec<_>>().join(" ")
            }
        }
        ShellCommand::Read(rec_no) => {
            let record = store.read(rec_no).await?;
            FIELD_NAMES
                .iter()
                .zip(record.iter())
                .map(|(name, value)| format!("{name:>12}: {value}"))
                .collect::<Vec<_>>()
                .join("\n")
        }
        ShellCommand::Create(record) => format!("created {}", store.create(record).await?),
        ShellCommand::Update {
            rec_no,
            cookie,
            record,
        } => {
            store.update(rec_no, record, cookie).await?;
            format!("updated {rec_no}")
        }
        ShellCommand::Delete { rec_no, cookie } => {
            store.delete(rec_no, cookie).await?;
            format!("deleted {rec_no}")
        }
        ShellCommand::Lock(rec_no) => format!("cookie {}", store.lock(rec_no).await?),
        ShellCommand::Unlock { rec_no, cookie } => {
            store.unlock(rec_no, cookie).await?;
            format!("unlocked {rec_no}")
        }
        ShellCommand::Exit => String::new(),
    })
}

/// Interactive readline shell.
fn interactive_shell(rt: &Runtime, store: &RemoteStore) -> anyhow::Result<()> {
    let mut rl = DefaultEditor::new()?;
    let prompt = "recdb> ";
    println!("connected to {}", store.peer());

    loop {
        match rl.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);
                match command::parse(trimmed) {
                    Ok(ShellCommand::Exit) => break,
                    Ok(cmd) => match rt.block_on(run(store, cmd)) {
                        Ok(out) => println!("{out}"),
                        Err(e) => eprintln!("Error: {e}"),
                    },
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Readline error: {err}");
                break;
            }
        }
    }
    Ok(())
}
