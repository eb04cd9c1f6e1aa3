//! Watch a printer and mirror its status into a JSON file.
//!
//! The file is rewritten on every status report and keeps the key set the
//! desktop app polls for.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use printer_watch::config::WatchArgs;
use printer_watch::link::tcp::TcpLink;
use printer_watch::signal::shutdown_signal;
use printer_watch::sink::{DEFAULT_STATUS_FILE, FileSink};
use printer_watch::tracing::prelude::*;
use printer_watch::{ConnectionManager, SnapshotStore};

#[derive(Debug, Parser)]
#[command(name = "printer-watchd", version, about)]
struct Cli {
    #[command(flatten)]
    watch: WatchArgs,

    /// Status file to keep up to date.
    #[arg(long, env = "PRINTER_WATCH_STATUS_FILE", default_value = DEFAULT_STATUS_FILE)]
    status_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    printer_watch::tracing::init_journald_or_stdout();
    let cli = Cli::parse();

    let store = SnapshotStore::new();
    store.subscribe(FileSink::new(&cli.status_file));
    let manager = ConnectionManager::new(TcpLink::new(), store.clone());

    info!(status_file = %cli.status_file.display(), "Starting printer monitoring");
    manager.start(cli.watch.to_config()).await?;

    let fatal = tokio::select! {
        _ = shutdown_signal() => None,
        _ = manager.terminated() => manager.take_fatal_error(),
    };

    info!("Stopping printer monitoring");
    manager.stop().await;
    store.close_listeners().await;

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
