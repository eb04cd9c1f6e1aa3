//! Canonical representation of the printer's last known status.

use std::fmt;

/// Humidity as reported by the first AMS unit.
///
/// Firmware revisions disagree on the type: most send a string index
/// (`"4"`), some a bare number. Both are kept as reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Humidity {
    Text(String),
    Number(f64),
}

impl fmt::Display for Humidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Humidity::Text(s) => f.write_str(s),
            Humidity::Number(n) => write!(f, "{}", n),
        }
    }
}

/// A fully decoded status report.
///
/// Every field is `None` when the report did not carry a usable value, which
/// is distinct from a reported zero or empty string. Snapshots are never
/// mutated after construction; a new report always produces a new snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    /// Machine state as reported (`IDLE`, `RUNNING`, `PAUSE`, `FINISH`, ...).
    pub gcode_state: Option<String>,

    /// Nozzle temperature (°C).
    pub nozzle_temperature: Option<f64>,

    /// Bed temperature (°C).
    pub bed_temperature: Option<f64>,

    /// Label of the current print job.
    pub job_name: Option<String>,

    /// Job progress, 0--100.
    pub progress_percent: Option<f64>,

    /// Estimated time remaining (minutes).
    pub remaining_minutes: Option<f64>,

    /// Humidity of the first AMS unit only; further units are not surfaced.
    pub ams_humidity: Option<Humidity>,
}

impl StatusSnapshot {
    /// The snapshot held before the first report arrives.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when no field carries a value.
    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }
}
