//! Labeled status panel refreshed on a fixed timer.
//!
//! The display never talks to the connection task. It polls
//! [`SnapshotStore::get`] on its own interval and redraws only when the store
//! version or the connection state moved since the last draw, so any front
//! end (terminal here, a GUI elsewhere) can drive it at its own cadence.

use std::io::{self, Write};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::manager::ConnectionState;
use crate::snapshot::StatusSnapshot;
use crate::store::SnapshotStore;
use crate::tracing::prelude::*;

/// Refresh cadence of the desktop display.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(5);

/// Shown for any field the printer did not report.
pub const ABSENT: &str = "N/A";

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// One rendered frame: connection header plus labeled rows.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPanel {
    pub connection: ConnectionState,
    /// True when the rows come from an earlier session, not a live link.
    pub stale: bool,
    pub rows: Vec<(&'static str, String)>,
}

impl StatusPanel {
    pub fn from_snapshot(snapshot: &StatusSnapshot, connection: ConnectionState) -> Self {
        let text = |value: &Option<String>| value.clone().unwrap_or_else(|| ABSENT.to_string());

        let rows = vec![
            ("State", text(&snapshot.gcode_state)),
            (
                "Nozzle Temperature",
                with_unit(snapshot.nozzle_temperature, "°C"),
            ),
            ("Bed Temperature", with_unit(snapshot.bed_temperature, "°C")),
            ("Job Name", text(&snapshot.job_name)),
            ("Progress", with_unit(snapshot.progress_percent, "%")),
            ("Time Remaining", with_unit(snapshot.remaining_minutes, " min")),
            (
                "AMS Humidity",
                snapshot
                    .ams_humidity
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| ABSENT.to_string()),
            ),
        ];

        Self {
            connection,
            stale: connection != ConnectionState::Connected && !snapshot.is_empty(),
            rows,
        }
    }

    pub fn render(&self, out: &mut impl Write) -> io::Result<()> {
        let width = self.rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);

        if self.stale {
            writeln!(out, "Printer: {} (showing last known status)", self.connection)?;
        } else {
            writeln!(out, "Printer: {}", self.connection)?;
        }
        for (label, value) in &self.rows {
            writeln!(out, "  {label:<width$}  {value}")?;
        }
        out.flush()
    }
}

/// Whole numbers print without a fraction, others with one decimal.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}

fn with_unit(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{}{unit}", format_number(v)),
        None => ABSENT.to_string(),
    }
}

/// Periodic redraw driver.
pub struct DisplayTicker<W> {
    store: SnapshotStore,
    connection: watch::Receiver<ConnectionState>,
    out: W,
    refresh: Duration,
    clear_screen: bool,
    last_drawn: Option<(u64, ConnectionState)>,
}

impl<W: Write> DisplayTicker<W> {
    pub fn new(
        store: SnapshotStore,
        connection: watch::Receiver<ConnectionState>,
        out: W,
    ) -> Self {
        Self {
            store,
            connection,
            out,
            refresh: DEFAULT_REFRESH,
            clear_screen: false,
            last_drawn: None,
        }
    }

    pub fn refresh_every(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    /// Clear the terminal before each frame.
    pub fn clear_screen(mut self, clear: bool) -> Self {
        self.clear_screen = clear;
        self
    }

    /// Redraw if anything changed since the last frame. Returns whether a
    /// frame was drawn.
    pub fn draw_if_changed(&mut self) -> io::Result<bool> {
        let connection = *self.connection.borrow();
        let (snapshot, version) = self.store.get();
        if self.last_drawn == Some((version, connection)) {
            return Ok(false);
        }

        if self.clear_screen {
            self.out.write_all(CLEAR_SCREEN.as_bytes())?;
        }
        StatusPanel::from_snapshot(&snapshot, connection).render(&mut self.out)?;
        self.last_drawn = Some((version, connection));
        Ok(true)
    }

    /// Tick until `shutdown` fires. Draw failures are logged and retried on
    /// the next tick.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.draw_if_changed() {
                        warn!(error = %e, "Failed to draw status panel");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::snapshot::Humidity;

    /// Writer whose contents the test can inspect while a task owns it.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }

        fn frames(&self) -> usize {
            self.text().matches("Printer: ").count()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn printing() -> StatusSnapshot {
        StatusSnapshot {
            gcode_state: Some("RUNNING".into()),
            nozzle_temperature: Some(219.6875),
            bed_temperature: Some(60.0),
            job_name: Some("benchy".into()),
            progress_percent: Some(42.0),
            remaining_minutes: Some(17.0),
            ams_humidity: Some(Humidity::Text("35".into())),
        }
    }

    fn value<'a>(panel: &'a StatusPanel, label: &str) -> &'a str {
        panel
            .rows
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[test]
    fn rows_carry_units() {
        let panel = StatusPanel::from_snapshot(&printing(), ConnectionState::Connected);

        assert_eq!(value(&panel, "State"), "RUNNING");
        assert_eq!(value(&panel, "Nozzle Temperature"), "219.7°C");
        assert_eq!(value(&panel, "Bed Temperature"), "60°C");
        assert_eq!(value(&panel, "Job Name"), "benchy");
        assert_eq!(value(&panel, "Progress"), "42%");
        assert_eq!(value(&panel, "Time Remaining"), "17 min");
        assert_eq!(value(&panel, "AMS Humidity"), "35");
        assert!(!panel.stale);
    }

    #[test]
    fn absent_fields_render_na() {
        let panel =
            StatusPanel::from_snapshot(&StatusSnapshot::empty(), ConnectionState::Connecting);

        assert_eq!(panel.rows.len(), 7);
        assert!(panel.rows.iter().all(|(_, v)| v == ABSENT));
        assert!(!panel.stale);
    }

    #[test]
    fn disconnected_panel_is_marked_stale() {
        let panel = StatusPanel::from_snapshot(&printing(), ConnectionState::Reconnecting);
        assert!(panel.stale);

        let mut out = Vec::new();
        panel.render(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Printer: Reconnecting (showing last known status)"));
        assert!(text.contains("Job Name            benchy"), "{text}");
    }

    #[test]
    fn redraws_only_on_change() {
        let store = SnapshotStore::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let buf = SharedBuf::default();
        let mut ticker = DisplayTicker::new(store.clone(), state_rx, buf.clone());

        assert!(ticker.draw_if_changed().unwrap());
        assert!(!ticker.draw_if_changed().unwrap());

        store.set(printing());
        assert!(ticker.draw_if_changed().unwrap());
        assert!(!ticker.draw_if_changed().unwrap());

        state_tx.send_replace(ConnectionState::Reconnecting);
        assert!(ticker.draw_if_changed().unwrap());
        assert_eq!(buf.frames(), 3);
    }

    #[test]
    fn poll_shows_newest_of_two_sets() {
        let store = SnapshotStore::new();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let buf = SharedBuf::default();
        let mut ticker = DisplayTicker::new(store.clone(), state_rx, buf.clone());

        let mut first = printing();
        first.gcode_state = Some("PREPARE".into());
        store.set(first);
        store.set(printing());

        ticker.draw_if_changed().unwrap();
        let text = buf.text();
        assert!(text.contains("RUNNING"));
        assert!(!text.contains("PREPARE"));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_fixed_interval() {
        let store = SnapshotStore::new();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let buf = SharedBuf::default();
        let shutdown = CancellationToken::new();

        let ticker = DisplayTicker::new(store.clone(), state_rx, buf.clone())
            .refresh_every(DEFAULT_REFRESH)
            .clear_screen(true);
        let task = tokio::spawn(ticker.run(shutdown.clone()));

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(buf.frames(), 1);

        store.set(printing());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(buf.frames(), 1, "redrew before the next tick");

        tokio::time::sleep(DEFAULT_REFRESH).await;
        assert_eq!(buf.frames(), 2);
        assert!(buf.text().contains(CLEAR_SCREEN));

        // Unchanged store: later ticks draw nothing.
        tokio::time::sleep(DEFAULT_REFRESH * 3).await;
        assert_eq!(buf.frames(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }
}
