//! Terminal status display.
//!
//! Shows the printer's state, temperatures, job, progress and AMS humidity,
//! refreshed on a fixed interval.

use std::io::IsTerminal;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use printer_watch::config::WatchArgs;
use printer_watch::display::DisplayTicker;
use printer_watch::link::tcp::TcpLink;
use printer_watch::signal::shutdown_signal;
use printer_watch::tracing::prelude::*;
use printer_watch::{ConnectionManager, SnapshotStore};

#[derive(Debug, Parser)]
#[command(name = "printer-watch-display", version, about)]
struct Cli {
    #[command(flatten)]
    watch: WatchArgs,

    /// Seconds between refreshes.
    #[arg(long, env = "PRINTER_WATCH_REFRESH_SECS", default_value_t = 5)]
    refresh_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    printer_watch::tracing::init_journald_or_stdout();
    let cli = Cli::parse();

    let store = SnapshotStore::new();
    let manager = ConnectionManager::new(TcpLink::new(), store.clone());

    let shutdown = CancellationToken::new();
    let stdout = std::io::stdout();
    let ticker = DisplayTicker::new(store, manager.state_watch(), stdout)
        .refresh_every(Duration::from_secs(cli.refresh_secs.max(1)))
        .clear_screen(std::io::stdout().is_terminal());
    let display = tokio::spawn(ticker.run(shutdown.clone()));

    let fatal = match manager.start(cli.watch.to_config()).await {
        Ok(_) => tokio::select! {
            _ = shutdown_signal() => None,
            _ = manager.terminated() => manager.take_fatal_error(),
        },
        Err(e) => Some(e),
    };

    info!("Closing display");
    manager.stop().await;
    shutdown.cancel();
    display.await?;

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
