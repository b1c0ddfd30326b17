//! Broker configuration.

use std::path::PathBuf;
use std::time::Duration;

use warden_core::constants::{
    ACCESS_RECHECK_INTERVAL, DEFAULT_IDLE_TIMEOUT, FLUSH_INTERVAL, KEEPALIVE_INTERVAL,
};

/// Process-wide configuration for the session data plane.
///
/// The tick intervals exist so tests can compress time; production
/// deployments keep the defaults.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Guacd daemon host (IPv4, IPv6 literal or hostname).
    pub guacd_host: String,
    /// Guacd daemon port.
    pub guacd_port: u16,
    /// Terminate sessions after this long without qualifying activity.
    pub idle_timeout: Duration,
    /// How often the access window is re-evaluated.
    pub access_recheck_interval: Duration,
    /// Output buffer flush interval for terminal sessions.
    pub flush_interval: Duration,
    /// Keep-alive interval for empty client frames.
    pub keepalive_interval: Duration,
    /// Where session recordings land, under one directory per day.
    pub replay_dir: PathBuf,
    /// Root of the per-asset drive-redirection directories.
    pub drive_root: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            guacd_host: "127.0.0.1".into(),
            guacd_port: 4822,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            access_recheck_interval: ACCESS_RECHECK_INTERVAL,
            flush_interval: FLUSH_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            replay_dir: PathBuf::from("/var/lib/warden/replay"),
            drive_root: PathBuf::from("/var/lib/warden/drive"),
        }
    }
}
