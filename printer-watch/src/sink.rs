//! JSON file sink.
//!
//! Writes every snapshot it is handed to a status file with a fixed key set,
//! the format external tools (the desktop app's status poller among them)
//! already read:
//!
//! ```json
//! {
//!   "gcode_state": "RUNNING",
//!   "nozzle_temper": 210,
//!   "bed_temper": 60,
//!   "subtask_name": "benchy",
//!   "mc_percent": 42,
//!   "mc_remaining_time": 17,
//!   "ams_humidity": "4"
//! }
//! ```
//!
//! Absent fields are written as `null`, except `ams_humidity` which is
//! written as `"N/A"`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::error::Result;
use crate::snapshot::{Humidity, StatusSnapshot};
use crate::store::SnapshotListener;
use crate::tracing::prelude::*;

/// Default status file name, relative to the working directory.
pub const DEFAULT_STATUS_FILE: &str = "printer_status.json";

/// Written for `ams_humidity` when no AMS humidity was reported.
pub const HUMIDITY_ABSENT: &str = "N/A";

/// On-disk form of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub gcode_state: Option<String>,
    pub nozzle_temper: Option<Number>,
    pub bed_temper: Option<Number>,
    pub subtask_name: Option<String>,
    pub mc_percent: Option<Number>,
    pub mc_remaining_time: Option<Number>,
    pub ams_humidity: String,
}

/// Whole values are written as integers, as the printer reports them.
fn to_number(value: Option<f64>) -> Option<Number> {
    let value = value?;
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(Number::from(value as i64))
    } else {
        Number::from_f64(value)
    }
}

impl From<&StatusSnapshot> for StatusDocument {
    fn from(snapshot: &StatusSnapshot) -> Self {
        Self {
            gcode_state: snapshot.gcode_state.clone(),
            nozzle_temper: to_number(snapshot.nozzle_temperature),
            bed_temper: to_number(snapshot.bed_temperature),
            subtask_name: snapshot.job_name.clone(),
            mc_percent: to_number(snapshot.progress_percent),
            mc_remaining_time: to_number(snapshot.remaining_minutes),
            ams_humidity: match &snapshot.ams_humidity {
                Some(Humidity::Text(s)) => s.clone(),
                Some(humidity @ Humidity::Number(_)) => humidity.to_string(),
                None => HUMIDITY_ABSENT.to_string(),
            },
        }
    }
}

/// Listener that mirrors the latest snapshot into a JSON file.
///
/// Files are replaced atomically (write to a sibling temp file, then
/// rename), so a reader never sees a partial document.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    temp_path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut temp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_STATUS_FILE.into());
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);
        Self { path, temp_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `snapshot` and replace the status file with it.
    pub async fn write(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let document = StatusDocument::from(snapshot);
        let mut bytes = serde_json::to_vec_pretty(&document)?;
        bytes.push(b'\n');

        tokio::fs::write(&self.temp_path, &bytes).await?;
        tokio::fs::rename(&self.temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotListener for FileSink {
    fn name(&self) -> &str {
        "file-sink"
    }

    async fn on_snapshot(&mut self, snapshot: Arc<StatusSnapshot>, version: u64) -> Result<()> {
        self.write(&snapshot).await?;
        debug!(version, path = %self.path.display(), "Status file written");
        Ok(())
    }
}
