//! Newline-delimited JSON link over TCP.
//!
//! Wire format, one JSON object per line in each direction:
//!
//! ```text
//! client -> {"auth":{"access_code":"...","serial":"..."}}
//! device <- {"auth":{"result":"ok"}}            (or "denied" / "unknown_device")
//! device <- {"print":{"gcode_state":"RUNNING", ...}}
//! device <- {"print":{"mc_percent":43}}
//! client -> {"pushing":{"sequence_id":"0","command":"pushall"}}
//! ```
//!
//! After the auth reply every line from the device is a status report.
//! Lines that are not valid JSON are logged and skipped; a bad report is a
//! decode problem, not a reason to drop the link.

use async_trait::async_trait;
use futures::SinkExt;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::{LinkError, LinkEvent, LinkSession, PrinterLink, RawStatusMessage};
use crate::config::DeviceTarget;
use crate::tracing::prelude::*;

/// Longest line accepted from the device. A full info dump is tens of KiB.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

type Reader = FramedRead<OwnedReadHalf, LinesCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LinesCodec>;

impl From<LinesCodecError> for LinkError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                LinkError::Protocol(format!("line longer than {MAX_LINE_LENGTH} bytes"))
            }
            LinesCodecError::Io(e) => LinkError::Io(e),
        }
    }
}

/// [`PrinterLink`] speaking newline-delimited JSON over plain TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpLink;

impl TcpLink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PrinterLink for TcpLink {
    async fn connect(&self, target: &DeviceTarget) -> Result<Box<dyn LinkSession>, LinkError> {
        let address = target.address();
        debug!(%address, "Opening link");

        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader =
            FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut writer = FramedWrite::new(write_half, LinesCodec::new());

        let hello = json!({
            "auth": {
                "access_code": target.access_code,
                "serial": target.serial,
            }
        });
        writer.send(hello.to_string()).await?;

        let reply = match reader.next().await {
            Some(line) => line?,
            None => return Err(LinkError::Closed),
        };
        check_auth_reply(&reply, &target.serial)?;

        debug!(%address, serial = %target.serial, "Link authenticated");
        Ok(Box::new(TcpSession {
            reader: Some(reader),
            writer,
            shutdown: CancellationToken::new(),
            receiver: None,
        }))
    }
}

/// Interpret the device's answer to the auth line.
fn check_auth_reply(line: &str, serial: &str) -> Result<(), LinkError> {
    let reply: Value = serde_json::from_str(line)
        .map_err(|e| LinkError::Protocol(format!("unreadable auth reply: {e}")))?;

    let auth = reply
        .get("auth")
        .ok_or_else(|| LinkError::Protocol("auth reply missing".into()))?;
    let reason = auth
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match auth.get("result").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        Some("denied") => Err(LinkError::AuthRejected(reason)),
        Some("unknown_device") => Err(LinkError::UnknownDevice(serial.to_string())),
        Some(other) => Err(LinkError::Protocol(format!("unexpected auth result {other:?}"))),
        None => Err(LinkError::Protocol("auth result missing".into())),
    }
}

struct TcpSession {
    /// Taken by `subscribe`.
    reader: Option<Reader>,
    writer: Writer,
    shutdown: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

#[async_trait]
impl LinkSession for TcpSession {
    async fn subscribe(&mut self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| LinkError::Protocol("session already subscribed".into()))?;

        let shutdown = self.shutdown.clone();
        self.receiver = Some(tokio::spawn(receive_loop(reader, events, shutdown)));
        Ok(())
    }

    async fn request_info_dump(&mut self) -> Result<(), LinkError> {
        let request = json!({
            "pushing": {
                "sequence_id": "0",
                "command": "pushall",
            }
        });
        self.writer.send(request.to_string()).await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.shutdown.cancel();
        if let Some(receiver) = self.receiver.take() {
            if let Err(e) = receiver.await {
                warn!(error = %e, "Link receiver ended abnormally");
            }
        }
        // Best effort; the peer may already be gone.
        let _ = SinkExt::<String>::close(&mut self.writer).await;
    }
}

// A session dropped without `disconnect` still stops its receiver.
impl Drop for TcpSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn receive_loop(
    mut reader: Reader,
    events: mpsc::Sender<LinkEvent>,
    shutdown: CancellationToken,
) {
    if !forward(&events, &shutdown, LinkEvent::Connected).await {
        return;
    }

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = reader.next() => line,
        };

        let event = match line {
            Some(Ok(line)) => match serde_json::from_str::<Value>(&line) {
                Ok(value) => LinkEvent::Message(RawStatusMessage::new(value)),
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable report");
                    continue;
                }
            },
            Some(Err(e)) => {
                let _ = forward(&events, &shutdown, LinkEvent::Dropped(e.into())).await;
                return;
            }
            None => {
                let _ = forward(&events, &shutdown, LinkEvent::Dropped(LinkError::Closed)).await;
                return;
            }
        };

        if !forward(&events, &shutdown, event).await {
            return;
        }
    }
}

/// Send an event unless shutdown wins first. Returns false if the loop
/// should exit.
async fn forward(
    events: &mpsc::Sender<LinkEvent>,
    shutdown: &CancellationToken,
    event: LinkEvent,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}
