//! Protocol and configuration constants for warden.

use std::time::Duration;

// =============================================================================
// Guacd Handshake Constants
// =============================================================================

/// Protocol version announced to guacd.
pub const GUACD_VERSION: &str = "VERSION_1_5_0";

/// Client name announced to guacd.
pub const CLIENT_NAME: &str = "Warden";

/// Recording path inside the guacd container.
pub const RECORDING_PATH: &str = "/replay";

/// Whether guacd should create the recording path.
pub const CREATE_RECORDING_PATH: &str = "true";

/// Whether guacd should ignore TLS certificate errors on the target.
pub const IGNORE_CERT: &str = "true";

/// Resize method requested for RDP sessions.
pub const RESIZE_METHOD: &str = "display-update";

/// Audio mimetype offered during the handshake.
pub const AUDIO_MIMETYPE: &str = "audio/L8";

/// Image mimetypes offered during the handshake.
pub const IMAGE_MIMETYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

// =============================================================================
// Default Target Ports
// =============================================================================

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default RDP port.
pub const DEFAULT_RDP_PORT: u16 = 3389;

/// Default VNC port.
pub const DEFAULT_VNC_PORT: u16 = 5900;

// =============================================================================
// Timing Constants
// =============================================================================

/// Default idle timeout when no per-deployment value is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Output buffer flush interval for terminal sessions.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Keep-alive interval for empty client frames.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Interval at which the access window is re-evaluated.
pub const ACCESS_RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// TCP dial timeout for guacd.
pub const GUACD_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// TCP dial timeout for SSH targets.
pub const SSH_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket handshake timeout.
pub const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on waiting for a client acknowledgement during a download.
pub const FILE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// How long terminal-state transfers stay queryable before the sweep
/// evicts them.
pub const TRANSFER_RETENTION: Duration = Duration::from_secs(300);

/// Interval of the transfer sweep task.
pub const TRANSFER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on delivering an administrative close reason to a session.
pub const ADMIN_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Buffer Sizes
// =============================================================================

/// Chunk size for file-transfer data instructions.
pub const FILE_CHUNK_SIZE: usize = 4096;

/// Depth of the per-session input/output channels.
pub const CHANNEL_DEPTH: usize = 8;

/// Capacity of the simplex pipes wiring the engine to the target session.
pub const PIPE_CAPACITY: usize = 64 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_constants_are_ordered() {
        assert!(FLUSH_INTERVAL < KEEPALIVE_INTERVAL);
        assert!(KEEPALIVE_INTERVAL < ACCESS_RECHECK_INTERVAL);
        assert!(SSH_DIAL_TIMEOUT <= GUACD_DIAL_TIMEOUT);
    }

    #[test]
    fn chunk_fits_in_pipe() {
        assert!(FILE_CHUNK_SIZE <= PIPE_CAPACITY);
    }

    #[test]
    fn guacd_version_format() {
        assert!(GUACD_VERSION.starts_with("VERSION_"));
    }
}
