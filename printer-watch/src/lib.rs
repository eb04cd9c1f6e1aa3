//! Status watch client for a network-attached 3D printer.
//!
//! The device pushes status reports over a long-lived link. This crate owns
//! that link, decodes each report into a [`StatusSnapshot`], and publishes
//! the latest one through a [`SnapshotStore`] that any number of consumers
//! can read or subscribe to without getting in each other's way.
//!
//! ```text
//! device -> PrinterLink -> ConnectionManager -> decode -> SnapshotStore
//!                                                            |
//!                                          +-----------------+-------------+
//!                                          |                               |
//!                                    FileSink (push)            display ticker (poll)
//! ```

pub mod backoff;
pub mod config;
pub mod decoder;
pub mod display;
pub mod error;
pub mod link;
pub mod manager;
pub mod signal;
pub mod sink;
pub mod snapshot;
pub mod store;
pub mod tracing;

pub use config::{BackoffConfig, DeviceTarget, WatchConfig};
pub use decoder::{ReportMerger, decode};
pub use error::{Error, Result};
pub use link::{LinkError, LinkEvent, LinkSession, PrinterLink, RawStatusMessage};
pub use manager::{ConnectionManager, ConnectionState, StartOutcome};
pub use snapshot::{Humidity, StatusSnapshot};
pub use store::{ListenerId, SnapshotListener, SnapshotStore};
