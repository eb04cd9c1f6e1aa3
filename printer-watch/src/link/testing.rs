//! Scripted [`PrinterLink`] for exercising the connection manager.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{LinkError, LinkEvent, LinkSession, PrinterLink, RawStatusMessage};
use crate::config::DeviceTarget;

/// What a session does after announcing `Connected`.
#[derive(Debug)]
pub(crate) enum Step {
    Message(Value),
    Pause(Duration),
    Drop(LinkError),
    /// Send `{"gcode_state": "RUNNING", "mc_percent": n}` every interval,
    /// forever.
    Stream(Duration),
}

/// Outcome of one `connect` call.
#[derive(Debug)]
pub(crate) enum Attempt {
    Fail(LinkError),
    /// Fail once the delay has passed, as a slow handshake would.
    FailAfter(Duration, LinkError),
    /// `connect` never completes.
    Hang,
    Session(Vec<Step>),
}

/// Shared counters for assertions.
#[derive(Debug, Default)]
pub(crate) struct LinkStats {
    pub connects: AtomicUsize,
    pub live_receivers: AtomicUsize,
    pub dump_requests: Mutex<Vec<Instant>>,
    pub subscribed_at: Mutex<Vec<Instant>>,
}

impl LinkStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn live_receivers(&self) -> usize {
        self.live_receivers.load(Ordering::SeqCst)
    }
}

/// Hands out attempts in order. Once the script runs out, every further
/// connect times out.
pub(crate) struct ScriptedLink {
    attempts: Mutex<VecDeque<Attempt>>,
    pub stats: Arc<LinkStats>,
}

impl ScriptedLink {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            stats: Arc::new(LinkStats::default()),
        }
    }
}

pub(crate) fn report(state: &str) -> Value {
    json!({ "print": { "gcode_state": state } })
}

#[async_trait]
impl PrinterLink for ScriptedLink {
    async fn connect(&self, _target: &DeviceTarget) -> Result<Box<dyn LinkSession>, LinkError> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let attempt = self.attempts.lock().pop_front();
        match attempt {
            Some(Attempt::Session(steps)) => Ok(Box::new(ScriptedSession {
                steps: Some(steps),
                stats: Arc::clone(&self.stats),
                shutdown: CancellationToken::new(),
                receiver: None,
            })),
            Some(Attempt::Fail(err)) => Err(err),
            Some(Attempt::FailAfter(delay, err)) => {
                tokio::time::sleep(delay).await;
                Err(err)
            }
            Some(Attempt::Hang) => std::future::pending().await,
            None => Err(LinkError::Timeout),
        }
    }
}

struct ScriptedSession {
    steps: Option<Vec<Step>>,
    stats: Arc<LinkStats>,
    shutdown: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

/// Decrements the live receiver count however the task ends.
struct LiveGuard(Arc<LinkStats>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live_receivers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkSession for ScriptedSession {
    async fn subscribe(&mut self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError> {
        let steps = self
            .steps
            .take()
            .ok_or_else(|| LinkError::Protocol("session already subscribed".into()))?;

        self.stats.subscribed_at.lock().push(Instant::now());
        self.stats.live_receivers.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.stats));
        let shutdown = self.shutdown.clone();

        self.receiver = Some(tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = play(steps, events.clone()) => {
                    // Script done; hold the link open until told to close.
                    shutdown.cancelled().await;
                }
            }
        }));
        Ok(())
    }

    async fn request_info_dump(&mut self) -> Result<(), LinkError> {
        self.stats.dump_requests.lock().push(Instant::now());
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.shutdown.cancel();
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.await;
        }
    }
}

async fn play(steps: Vec<Step>, events: mpsc::Sender<LinkEvent>) {
    if events.send(LinkEvent::Connected).await.is_err() {
        return;
    }

    for step in steps {
        let event = match step {
            Step::Message(value) => LinkEvent::Message(RawStatusMessage::new(value)),
            Step::Pause(duration) => {
                tokio::time::sleep(duration).await;
                continue;
            }
            Step::Drop(err) => {
                let _ = events.send(LinkEvent::Dropped(err)).await;
                return;
            }
            Step::Stream(interval) => {
                let mut n = 0u64;
                loop {
                    tokio::time::sleep(interval).await;
                    n += 1;
                    let value = json!({ "gcode_state": "RUNNING", "mc_percent": n % 101 });
                    if events
                        .send(LinkEvent::Message(RawStatusMessage::new(value)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        };

        if events.send(event).await.is_err() {
            return;
        }
    }
}
