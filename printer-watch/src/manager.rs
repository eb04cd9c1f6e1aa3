//! Connection lifecycle for the watch client.
//!
//! The manager owns the printer link and its [`ConnectionState`]. One
//! background task per running connection drains the session's event
//! channel, folds every report into the fields seen so far on that session,
//! decodes the result and writes it into the [`SnapshotStore`]. When the link drops the task reconnects with jittered
//! exponential backoff; when it fails in a way retrying cannot fix, the task
//! records the error and stops.
//!
//! # State machine
//!
//! ```text
//!                start()          link up
//!  Disconnected ────────► Connecting ───────► Connected ◄──────┐
//!                             │                   │            │ link up
//!                             │ retryable         │ dropped    │
//!                             ▼                   ▼            │
//!                        Reconnecting ◄───────────┴────────────┘
//!
//!  any state ── stop() / fatal error / retries exhausted ──► Stopped
//! ```
//!
//! `Stopped` is left only by another call to [`ConnectionManager::start`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::config::WatchConfig;
use crate::decoder::{ReportMerger, decode};
use crate::error::{Error, Result};
use crate::link::{LinkError, LinkEvent, LinkSession, PrinterLink};
use crate::store::SnapshotStore;
use crate::tracing::prelude::*;

/// Where the watch client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Result of [`ConnectionManager::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A connection is already active; nothing was changed.
    AlreadyRunning,
    /// `stop` was called before the first connection attempt finished.
    Cancelled,
}

/// State visible to both the manager handle and its connection task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    fatal: Mutex<Option<Error>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    fn fail(&self, error: Error) {
        error!(error = %error, "Watch client stopped on fatal error");
        *self.fatal.lock() = Some(error);
        self.set_state(ConnectionState::Stopped);
    }
}

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// A live session plus the channel its events arrive on.
type Connection = (Box<dyn LinkSession>, mpsc::Receiver<LinkEvent>);

/// Owner of the printer link.
pub struct ConnectionManager {
    link: Arc<dyn PrinterLink>,
    store: SnapshotStore,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
    /// Shutdown token of a `start` still in its first connection attempt.
    starting: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(link: impl PrinterLink, store: SnapshotStore) -> Self {
        Self::with_link(Arc::new(link), store)
    }

    pub fn with_link(link: Arc<dyn PrinterLink>, store: SnapshotStore) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link,
            store,
            shared: Arc::new(Shared {
                state,
                fatal: Mutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
            starting: Mutex::new(None),
        }
    }

    /// The store this manager publishes into.
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Take the error that made the manager stop itself, if any.
    pub fn take_fatal_error(&self) -> Option<Error> {
        self.shared.fatal.lock().take()
    }

    /// Resolve once the manager reaches [`ConnectionState::Stopped`].
    pub async fn terminated(&self) {
        let mut state = self.state_watch();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = state.wait_for(|s| *s == ConnectionState::Stopped).await;
    }

    /// Connect to the printer and start watching it.
    ///
    /// The first connection attempt happens before this returns so a bad
    /// access code or serial is reported to the caller directly. A transient
    /// failure instead leaves the manager in `Reconnecting` with the
    /// background task retrying.
    pub async fn start(&self, config: WatchConfig) -> Result<StartOutcome> {
        let mut running = self.running.lock().await;

        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Stopped
        ) {
            info!(state = %state, "Watch client already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        // A task that stopped itself on a fatal error has already exited;
        // reap it before replacing it.
        if let Some(previous) = running.take() {
            previous.shutdown.cancel();
            let _ = previous.task.await;
        }
        self.shared.fatal.lock().take();

        self.shared.set_state(ConnectionState::Connecting);
        info!(
            address = %config.target.address(),
            serial = %config.target.serial,
            "Connecting to printer"
        );

        let shutdown = CancellationToken::new();
        *self.starting.lock() = Some(shutdown.clone());
        let opened = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            opened = open(self.link.as_ref(), &config) => Some(opened),
        };
        self.starting.lock().take();

        let Some(opened) = opened else {
            info!("Stopped while connecting");
            self.shared.set_state(ConnectionState::Stopped);
            return Ok(StartOutcome::Cancelled);
        };

        let first = match opened {
            Ok(connection) => {
                self.shared.set_state(ConnectionState::Connected);
                Ok(connection)
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Printer refused connection");
                self.shared.set_state(ConnectionState::Stopped);
                return Err(Error::Link(e));
            }
            Err(e) => {
                warn!(error = %e, "Printer unreachable, will retry");
                self.shared.set_state(ConnectionState::Reconnecting);
                Err(e)
            }
        };

        let driver = Driver {
            link: Arc::clone(&self.link),
            backoff: ExponentialBackoff::new(&config.backoff),
            config,
            store: self.store.clone(),
            shared: Arc::clone(&self.shared),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(driver.run(first));

        *running = Some(Running { shutdown, task });
        Ok(StartOutcome::Started)
    }

    /// Stop watching and release the link.
    ///
    /// Waits for the connection task to exit, so no snapshot is written
    /// after this returns. The store keeps its last value. Safe to call at
    /// any time, any number of times, including while `start` is still
    /// making its first attempt.
    pub async fn stop(&self) {
        if let Some(starting) = self.starting.lock().as_ref() {
            starting.cancel();
        }

        let mut running = self.running.lock().await;
        if let Some(running) = running.take() {
            running.shutdown.cancel();
            if let Err(e) = running.task.await {
                warn!(error = %e, "Connection task ended abnormally");
            }
            info!("Watch client stopped");
        }
        self.shared.set_state(ConnectionState::Stopped);
    }
}

/// Connect and subscribe, bounded by the configured timeout.
async fn open(
    link: &dyn PrinterLink,
    config: &WatchConfig,
) -> std::result::Result<Connection, LinkError> {
    let mut session = tokio::time::timeout(config.connect_timeout, link.connect(&config.target))
        .await
        .map_err(|_| LinkError::Timeout)??;

    let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
    if let Err(e) = session.subscribe(tx).await {
        session.disconnect().await;
        return Err(e);
    }
    Ok((session, rx))
}

/// Why a session ended.
enum Exit {
    Shutdown,
    Dropped(LinkError),
}

/// The per-connection background task.
struct Driver {
    link: Arc<dyn PrinterLink>,
    config: WatchConfig,
    backoff: ExponentialBackoff,
    store: SnapshotStore,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self, first: std::result::Result<Connection, LinkError>) {
        let mut next = first;

        loop {
            let (session, events) = match next {
                Ok(connection) => connection,
                Err(cause) => match self.reconnect(cause).await {
                    Some(connection) => connection,
                    None => return,
                },
            };

            match self.pump(session, events).await {
                Exit::Shutdown => return,
                Exit::Dropped(e) if e.is_fatal() => {
                    self.shared.fail(Error::Link(e));
                    return;
                }
                Exit::Dropped(e) => {
                    warn!(error = %e, "Lost connection to printer");
                    self.shared.set_state(ConnectionState::Reconnecting);
                    next = Err(e);
                }
            }
        }
    }

    /// Feed one session's events through the decoder into the store.
    async fn pump(
        &mut self,
        mut session: Box<dyn LinkSession>,
        mut events: mpsc::Receiver<LinkEvent>,
    ) -> Exit {
        let mut dump_due: Option<Instant> = None;
        let mut merger = ReportMerger::new();

        let exit = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break Exit::Shutdown,

                _ = sleep_until_due(dump_due), if dump_due.is_some() => {
                    dump_due = None;
                    debug!("Requesting full status dump");
                    if let Err(e) = session.request_info_dump().await {
                        break Exit::Dropped(e);
                    }
                }

                event = events.recv() => match event {
                    Some(LinkEvent::Connected) => {
                        info!(address = %self.config.target.address(), "Watch client connected.");
                        self.shared.set_state(ConnectionState::Connected);
                        self.backoff.reset();
                        // The firmware drops a dump request that arrives
                        // before it has settled.
                        dump_due = Some(Instant::now() + self.config.settle_delay);
                    }
                    Some(LinkEvent::Message(raw)) => match merger.merge(raw) {
                        Some(merged) => {
                            let version = self.store.set(decode(&merged));
                            trace!(version, "Status report applied");
                        }
                        None => trace!("Ignoring report without status fields"),
                    },
                    Some(LinkEvent::Dropped(e)) => break Exit::Dropped(e),
                    None => break Exit::Dropped(LinkError::Closed),
                },
            }
        };

        session.disconnect().await;
        exit
    }

    /// Retry until a session opens. Returns `None` when the task should exit.
    async fn reconnect(&mut self, cause: LinkError) -> Option<Connection> {
        let mut last = cause;

        loop {
            let Some(delay) = self.backoff.next_delay() else {
                self.shared.fail(Error::RetriesExhausted {
                    attempts: self.backoff.attempts(),
                    last,
                });
                return None;
            };

            debug!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after delay"
            );

            let opened = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                opened = delayed_open(self.link.as_ref(), &self.config, delay) => opened,
            };

            match opened {
                Ok(connection) => {
                    info!(
                        attempt = self.backoff.attempts(),
                        "Reconnected to printer"
                    );
                    self.shared.set_state(ConnectionState::Connected);
                    return Some(connection);
                }
                Err(e) if e.is_fatal() => {
                    self.shared.fail(Error::Link(e));
                    return None;
                }
                Err(e) => {
                    debug!(error = %e, "Reconnection attempt failed");
                    last = e;
                }
            }
        }
    }
}

async fn delayed_open(
    link: &dyn PrinterLink,
    config: &WatchConfig,
    delay: Duration,
) -> std::result::Result<Connection, LinkError> {
    tokio::time::sleep(delay).await;
    open(link, config).await
}

async fn sleep_until_due(due: Option<Instant>) {
    if let Some(due) = due {
        tokio::time::sleep_until(due).await;
    }
}
