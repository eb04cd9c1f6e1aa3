//! Decoding of raw status reports into [`StatusSnapshot`]s.
//!
//! Reports are loosely typed and frequently partial: the device pushes
//! deltas containing only the fields that changed, and firmware versions
//! differ in what they send. Decoding is therefore total. Any field that is
//! missing or has the wrong shape becomes `None`; nothing here returns an
//! error.
//!
//! [`ReportMerger`] folds a session's deltas into one accumulated report so
//! that [`decode`] always sees every field the device has sent so far.

use serde_json::{Map, Value};

use crate::link::RawStatusMessage;
use crate::snapshot::{Humidity, StatusSnapshot};

/// Key of the envelope the device wraps print status in.
const PRINT_ENVELOPE: &str = "print";

/// Keys inside the envelope that feed a [`StatusSnapshot`].
const STATUS_KEYS: [&str; 7] = [
    "gcode_state",
    "nozzle_temper",
    "bed_temper",
    "subtask_name",
    "mc_percent",
    "mc_remaining_time",
    "ams",
];

/// Status fields accumulated over one session.
///
/// Each report's status fields replace the stored ones key by key; fields a
/// delta does not mention keep their last value. Create a fresh merger per
/// session.
#[derive(Debug, Default)]
pub struct ReportMerger {
    fields: Map<String, Value>,
}

impl ReportMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `raw` into the accumulated fields and return the merged report.
    ///
    /// Returns `None` for reports that carry no status field at all, such as
    /// version or system replies.
    pub fn merge(&mut self, raw: RawStatusMessage) -> Option<RawStatusMessage> {
        let Value::Object(mut root) = raw.into_value() else {
            return None;
        };
        let status = match root.remove(PRINT_ENVELOPE) {
            Some(Value::Object(print)) => print,
            _ => root,
        };

        let mut touched = false;
        for (key, value) in status {
            if STATUS_KEYS.contains(&key.as_str()) {
                self.fields.insert(key, value);
                touched = true;
            }
        }
        if !touched {
            return None;
        }

        let mut envelope = Map::new();
        envelope.insert(PRINT_ENVELOPE.to_owned(), Value::Object(self.fields.clone()));
        Some(RawStatusMessage::from(Value::Object(envelope)))
    }
}

/// Decode a raw report into a snapshot.
///
/// Reads from the `print` envelope when present, otherwise from the top
/// level. A report that is not a JSON object decodes to the empty snapshot.
pub fn decode(raw: &RawStatusMessage) -> StatusSnapshot {
    let Some(root) = raw.as_value().as_object() else {
        return StatusSnapshot::empty();
    };

    let status = match root.get(PRINT_ENVELOPE).and_then(Value::as_object) {
        Some(print) => print,
        None => root,
    };

    StatusSnapshot {
        gcode_state: string_field(status, "gcode_state"),
        nozzle_temperature: number_field(status, "nozzle_temper"),
        bed_temperature: number_field(status, "bed_temper"),
        job_name: string_field(status, "subtask_name"),
        progress_percent: number_field(status, "mc_percent")
            .filter(|p| (0.0..=100.0).contains(p)),
        remaining_minutes: number_field(status, "mc_remaining_time").filter(|m| *m >= 0.0),
        ams_humidity: ams_humidity(status),
    }
}

fn string_field(status: &Map<String, Value>, key: &str) -> Option<String> {
    status.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn number_field(status: &Map<String, Value>, key: &str) -> Option<f64> {
    status
        .get(key)
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite())
}

/// Humidity of the first AMS unit.
///
/// The device nests units as `ams.ams[]`. Only the first entry is surfaced
/// even when several units are attached.
fn ams_humidity(status: &Map<String, Value>) -> Option<Humidity> {
    let first_unit = status
        .get("ams")?
        .as_object()?
        .get("ams")?
        .as_array()?
        .first()?
        .as_object()?;

    match first_unit.get("humidity")? {
        Value::String(s) => Some(Humidity::Text(s.clone())),
        Value::Number(n) => n.as_f64().map(Humidity::Number),
        _ => None,
    }
}
