use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use micromq::store::record::decode_payload;
use micromq::store::{scan_log, QueueStore};

#[derive(Parser)]
#[command(name = "micromq-admin")]
#[command(about = "Inspect and maintain micromq queue logs offline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print depth, file size and invalid record ratio
    Stats {
        /// Queue log file (<data_dir>/queues/<queue>.log)
        log: PathBuf,
    },
    /// Rewrite the log with only live records
    Compact {
        log: PathBuf,
    },
    /// List records as JSON lines
    Dump {
        log: PathBuf,

        /// Include invalidated records
        #[arg(long)]
        all: bool,

        /// Print message bodies as lossy UTF-8
        #[arg(long)]
        bodies: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Stats { log } => {
            let store = open(&log)?;
            let stats = store.stats().context("scan log")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Compact { log } => {
            let store = open(&log)?;
            let report = store.compact().context("compact log")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Dump { log, all, bodies } => dump(&log, all, bodies)?,
    }
    Ok(())
}

fn open(log: &Path) -> Result<QueueStore> {
    if !log.exists() {
        anyhow::bail!("log file {} does not exist", log.display());
    }
    let store = QueueStore::at_path(log, true);
    store
        .recovery()
        .with_context(|| format!("recover {}", log.display()))?;
    Ok(store)
}

fn dump(log: &Path, all: bool, bodies: bool) -> Result<()> {
    let image = std::fs::read(log).with_context(|| format!("read {}", log.display()))?;
    let mut undecodable = 0usize;
    let summary = scan_log(&image, |record| {
        if !record.header.valid && !all {
            return;
        }
        let (properties, body) = match decode_payload(record.payload) {
            Ok(decoded) => decoded,
            Err(_) => {
                undecodable += 1;
                return;
            }
        };
        let mut line = json!({
            "offset": record.location.offset,
            "len": record.location.len,
            "valid": record.header.valid,
            "properties": properties,
            "body_len": body.len(),
        });
        if bodies {
            line["body"] = json!(String::from_utf8_lossy(&body));
        }
        println!("{line}");
    });
    let tail = match (summary.unframed_at, summary.torn_tail) {
        (Some(offset), _) => format!(", unreadable from offset {offset}"),
        (None, true) => ", torn tail".to_string(),
        (None, false) => String::new(),
    };
    eprintln!(
        "{} records ({} invalid, {} damaged, {} undecodable){tail}",
        summary.total, summary.invalid, summary.corrupt, undecodable
    );
    Ok(())
}
