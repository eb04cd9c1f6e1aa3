//! Watch client configuration.
//!
//! Configuration is assembled once at startup, usually from [`WatchArgs`],
//! and handed to [`ConnectionManager::start`] by value. Nothing in the crate
//! keeps connection parameters in mutable globals.
//!
//! [`ConnectionManager::start`]: crate::manager::ConnectionManager::start

use std::fmt;
use std::time::Duration;

use clap::Args;

/// Port the printer's status bridge listens on.
pub const DEFAULT_PORT: u16 = 8883;

/// Where the printer is and how to authenticate to it.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub host: String,
    pub port: u16,
    /// LAN access code shown on the printer's screen.
    pub access_code: String,
    /// Device serial number; selects the report stream.
    pub serial: String,
}

impl DeviceTarget {
    pub fn new(
        host: impl Into<String>,
        access_code: impl Into<String>,
        serial: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            access_code: access_code.into(),
            serial: serial.into(),
        }
    }

    /// `host:port` for logging and connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Keep the access code out of logs.
impl fmt::Debug for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("access_code", &"<redacted>")
            .field("serial", &self.serial)
            .finish()
    }
}

/// Reconnection policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub initial: Duration,
    /// Upper bound on the nominal delay.
    pub max: Duration,
    /// Consecutive failed attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

/// Everything [`ConnectionManager::start`] needs.
///
/// [`ConnectionManager::start`]: crate::manager::ConnectionManager::start
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub target: DeviceTarget,
    pub backoff: BackoffConfig,
    /// Pause between the link coming up and requesting a full info dump.
    /// The firmware ignores a dump request sent any earlier.
    pub settle_delay: Duration,
    /// Bound on establishing a link.
    pub connect_timeout: Duration,
    /// Depth of the link -> manager event channel.
    pub event_capacity: usize,
}

impl WatchConfig {
    pub fn new(target: DeviceTarget) -> Self {
        Self {
            target,
            backoff: BackoffConfig::default(),
            settle_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 64,
        }
    }
}

/// Command-line options shared by the binaries.
///
/// Every option can also be supplied through the environment.
#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Printer address.
    #[arg(long = "ip", visible_alias = "host", env = "PRINTER_WATCH_HOST")]
    pub host: String,

    /// LAN access code.
    #[arg(
        long = "code",
        visible_alias = "access-code",
        env = "PRINTER_WATCH_ACCESS_CODE",
        hide_env_values = true
    )]
    pub access_code: String,

    /// Printer serial number.
    #[arg(long, env = "PRINTER_WATCH_SERIAL")]
    pub serial: String,

    /// Status bridge port.
    #[arg(long, env = "PRINTER_WATCH_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// First reconnection delay, in seconds.
    #[arg(long, env = "PRINTER_WATCH_BACKOFF_INITIAL", default_value_t = 1)]
    pub backoff_initial_secs: u64,

    /// Longest reconnection delay, in seconds.
    #[arg(long, env = "PRINTER_WATCH_BACKOFF_MAX", default_value_t = 60)]
    pub backoff_max_secs: u64,

    /// Give up after this many consecutive failed reconnection attempts.
    #[arg(long, env = "PRINTER_WATCH_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,
}

impl WatchArgs {
    pub fn to_config(&self) -> WatchConfig {
        let mut target = DeviceTarget::new(&self.host, &self.access_code, &self.serial);
        target.port = self.port;

        let mut config = WatchConfig::new(target);
        config.backoff = BackoffConfig {
            initial: Duration::from_secs(self.backoff_initial_secs.max(1)),
            max: Duration::from_secs(self.backoff_max_secs.max(self.backoff_initial_secs)),
            max_attempts: self.max_attempts,
        };
        config
    }
}
