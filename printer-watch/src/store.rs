//! Latest-value store shared between the connection task and consumers.
//!
//! The connection task is the only writer. Consumers either poll with
//! [`SnapshotStore::get`] or register a [`SnapshotListener`] and have
//! snapshots pushed to them. Both paths see "latest wins" semantics: a slow
//! consumer skips intermediate snapshots instead of queueing them, and never
//! sees versions go backwards.
//!
//! The value lives in a `tokio::sync::watch` channel, so `get` and `set` each
//! hold its lock only long enough to clone or swap an `Arc`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::snapshot::StatusSnapshot;
use crate::tracing::prelude::*;

new_key_type! {
    /// Registration returned by [`SnapshotStore::subscribe`].
    pub struct ListenerId;
}

/// A snapshot together with the store version it was published as.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub snapshot: Arc<StatusSnapshot>,
    /// Number of `set` calls that preceded this value; 0 before the first.
    pub version: u64,
}

/// Push-mode consumer of snapshots.
///
/// Each listener gets its own delivery task. A call to `on_snapshot` is never
/// overlapped by another call for the same listener, and updates published
/// while it runs are coalesced into the newest one. Errors are logged and do
/// not stop delivery.
#[async_trait]
pub trait SnapshotListener: Send + 'static {
    /// Name used in log messages.
    fn name(&self) -> &str;

    async fn on_snapshot(&mut self, snapshot: Arc<StatusSnapshot>, version: u64) -> Result<()>;
}

struct Registration {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    latest: watch::Sender<Versioned>,
    listeners: Mutex<SlotMap<ListenerId, Registration>>,
}

/// Versioned holder of the latest [`StatusSnapshot`].
///
/// Cheap to clone; clones share the same value.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Inner>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    /// Create a store holding the empty snapshot at version 0.
    pub fn new() -> Self {
        let (latest, _) = watch::channel(Versioned {
            snapshot: Arc::new(StatusSnapshot::empty()),
            version: 0,
        });
        Self {
            inner: Arc::new(Inner {
                latest,
                listeners: Mutex::new(SlotMap::with_key()),
            }),
        }
    }

    /// Replace the latest snapshot and return its version.
    pub fn set(&self, snapshot: StatusSnapshot) -> u64 {
        let snapshot = Arc::new(snapshot);
        let mut version = 0;
        self.inner.latest.send_modify(|current| {
            current.version += 1;
            current.snapshot = snapshot;
            version = current.version;
        });
        trace!(version, "Snapshot stored");
        version
    }

    /// Latest snapshot and its version.
    pub fn get(&self) -> (Arc<StatusSnapshot>, u64) {
        let current = self.inner.latest.borrow();
        (Arc::clone(&current.snapshot), current.version)
    }

    /// Current version without cloning the snapshot.
    pub fn version(&self) -> u64 {
        self.inner.latest.borrow().version
    }

    /// Pull-mode handle that can await the next version.
    pub fn watch(&self) -> StoreWatcher {
        StoreWatcher {
            rx: self.inner.latest.subscribe(),
        }
    }

    /// Register a listener.
    ///
    /// If the store already holds a published snapshot the listener receives
    /// it right away. Must be called from within a Tokio runtime.
    pub fn subscribe<L: SnapshotListener>(&self, mut listener: L) -> ListenerId {
        let cancel = CancellationToken::new();
        let mut rx = self.inner.latest.subscribe();
        if rx.borrow().version > 0 {
            rx.mark_changed();
        }

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                debug!(listener = listener.name(), "Listener attached");
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }

                    let current = rx.borrow_and_update().clone();
                    if let Err(e) = listener
                        .on_snapshot(current.snapshot, current.version)
                        .await
                    {
                        warn!(
                            listener = listener.name(),
                            version = current.version,
                            error = %e,
                            "Listener failed to handle snapshot"
                        );
                    }
                }
                debug!(listener = listener.name(), "Listener detached");
            })
        };

        self.inner
            .listeners
            .lock()
            .insert(Registration { cancel, task })
    }

    /// Remove a listener. Returns false if it was not registered.
    ///
    /// A delivery already in progress runs to completion; no further
    /// snapshots are delivered after that.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.inner.listeners.lock().remove(id) {
            Some(registration) => {
                registration.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove every listener and wait for in-flight deliveries to finish.
    pub async fn close_listeners(&self) {
        let registrations: Vec<Registration> = self
            .inner
            .listeners
            .lock()
            .drain()
            .map(|(_, registration)| registration)
            .collect();

        for registration in &registrations {
            registration.cancel.cancel();
        }
        for registration in registrations {
            if let Err(e) = registration.task.await {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

/// Awaitable view of the store for pull consumers.
pub struct StoreWatcher {
    rx: watch::Receiver<Versioned>,
}

impl StoreWatcher {
    /// Wait for a version newer than the last one returned by this watcher.
    ///
    /// Returns `None` once every handle to the store has been dropped.
    pub async fn changed(&mut self) -> Option<Versioned> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the store reaches at least `version`.
    pub async fn wait_for(&mut self, version: u64) -> Option<Versioned> {
        let current = self.rx.borrow_and_update().clone();
        if current.version >= version {
            return Some(current);
        }
        loop {
            let next = self.changed().await?;
            if next.version >= version {
                return Some(next);
            }
        }
    }
}
