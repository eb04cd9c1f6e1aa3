//! The printer link: transport and session to the device.
//!
//! The connection manager only sees the [`PrinterLink`] and [`LinkSession`]
//! traits. A session pushes everything it receives onto a channel owned by
//! the manager's task rather than calling back into it, so decoding and
//! store updates never run re-entrantly inside transport code.
//!
//! ```text
//! PrinterLink::connect ──► LinkSession
//!                            │ subscribe(tx)
//!                            ▼
//!            tx: Connected, Message, Message, ..., Dropped(err)
//! ```

pub mod tcp;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::DeviceTarget;

/// An undecoded status report, exactly as the device sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStatusMessage(Value);

impl RawStatusMessage {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for RawStatusMessage {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// What a session delivers to its subscriber.
#[derive(Debug)]
pub enum LinkEvent {
    /// The watch subscription is live. Fires once per session.
    Connected,

    /// A status report arrived.
    Message(RawStatusMessage),

    /// The session failed; no further events follow.
    Dropped(LinkError),
}

/// Link-level failures.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("connection closed by device")]
    Closed,

    #[error("access code rejected: {0}")]
    AuthRejected(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl LinkError {
    /// Whether retrying cannot help.
    ///
    /// Bad credentials, a wrong serial, and a peer that does not speak the
    /// protocol stay wrong no matter how often we reconnect. Everything else
    /// is treated as a transient network problem.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::AuthRejected(_) | LinkError::UnknownDevice(_) | LinkError::Protocol(_)
        )
    }
}

/// Factory for sessions to a device.
#[async_trait]
pub trait PrinterLink: Send + Sync + 'static {
    /// Open and authenticate a session.
    async fn connect(&self, target: &DeviceTarget) -> Result<Box<dyn LinkSession>, LinkError>;
}

/// One authenticated session.
#[async_trait]
pub trait LinkSession: Send {
    /// Start receiving. Sends [`LinkEvent::Connected`] once the subscription
    /// is live, then one [`LinkEvent::Message`] per report.
    async fn subscribe(&mut self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError>;

    /// Ask the device to push its complete status.
    ///
    /// Only valid after [`LinkEvent::Connected`] and the settling delay.
    async fn request_info_dump(&mut self) -> Result<(), LinkError>;

    /// Close the session.
    ///
    /// Idempotent. Returns once the receive side has fully stopped, after
    /// which no more events are sent.
    async fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use std::io;

    use test_case::test_case;

    use super::*;

    #[test_case(LinkError::AuthRejected("denied".into()), true; "auth_rejected")]
    #[test_case(LinkError::UnknownDevice("SN1".into()), true; "unknown_device")]
    #[test_case(LinkError::Protocol("garbage".into()), true; "protocol")]
    #[test_case(LinkError::Timeout, false; "timeout")]
    #[test_case(LinkError::Closed, false; "closed")]
    #[test_case(LinkError::Io(io::Error::from(io::ErrorKind::ConnectionReset)), false; "io")]
    fn classification(error: LinkError, fatal: bool) {
        assert_eq!(error.is_fatal(), fatal);
    }
}
