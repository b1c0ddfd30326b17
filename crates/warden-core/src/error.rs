//! Error types for warden-core.

use thiserror::Error;

/// Main error type for warden operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to dial a remote endpoint.
    #[error("dial failed: {addr}: {message}")]
    Dial { addr: String, message: String },

    /// Handshake received an unexpected instruction.
    #[error("expect instruction \"{expected}\" but got \"{actual}\"")]
    Handshake { expected: String, actual: String },

    /// The daemon's `ready` instruction carried no connection id.
    #[error("empty connection id")]
    EmptyConnectionId,

    /// Protocol violation or malformed data.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Session not found in the online registry.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session terminated after a period with no client activity.
    #[error("session idle for more than {seconds} seconds")]
    IdleTimeout { seconds: u64 },

    /// Session terminated because the access window no longer permits it.
    #[error("access denied outside the allowed time window")]
    AccessWindow,

    /// Session closed by an administrator.
    #[error("session closed by {closer}")]
    AdminClose { closer: String },

    /// The remote target failed or ended the session.
    #[error("target error: {message}")]
    Target { message: String },

    /// Authentication to the remote target failed.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// File transfer error.
    #[error("file transfer error: {message}")]
    FileTransfer { message: String },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Returns true for expected, user-facing policy terminations.
    ///
    /// Policy violations end the session but are not bugs; they are written
    /// to the client before the transport closes.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Error::IdleTimeout { .. } | Error::AccessWindow | Error::AdminClose { .. }
        )
    }

    /// Returns true if this error aborts session creation before the session
    /// was ever registered.
    ///
    /// Fatal setup errors mean no teardown/persistence ever runs for the
    /// session, so no teardown race is possible.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            Error::Dial { .. }
                | Error::Handshake { .. }
                | Error::EmptyConnectionId
                | Error::AccessWindow
        )
    }
}

/// Convenience result type for warden operations.
pub type Result<T> = std::result::Result<T, Error>;
