//! Client transport abstraction.
//!
//! The session engine never touches a concrete socket type: browser
//! WebSockets, the pipe from an embedded SSH server and in-memory test
//! transports all implement [`ClientTransport`]. Passive monitors attach
//! through the same trait.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Frame tag for terminal data sent by web clients.
pub const FRAME_DATA: u8 = b'1';

/// Frame tag for client heartbeats (ignored by the engine).
pub const FRAME_HEARTBEAT: u8 = b'9';

/// Frame tag for terminal resize events, payload `"<width>,<height>"`.
pub const FRAME_RESIZE: u8 = b'w';

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl WindowSize {
    /// Parse the payload of a resize frame (`"<width>,<height>"`).
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let (w, h) = text.split_once(',')?;
        Some(Self {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
        })
    }
}

/// A bidirectional frame transport to one client or viewer.
///
/// `recv` resolves with [`crate::Error::ConnectionClosed`] once the peer is
/// gone; `send` with an empty frame is the keep-alive.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Receive the next frame from the peer.
    async fn recv(&self) -> Result<Bytes>;

    /// Send a frame to the peer.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Close the transport. Best effort, idempotent.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_parse() {
        assert_eq!(
            WindowSize::parse(b"120,40"),
            Some(WindowSize {
                width: 120,
                height: 40
            })
        );
        assert_eq!(
            WindowSize::parse(b" 80 , 24 "),
            Some(WindowSize {
                width: 80,
                height: 24
            })
        );
    }

    #[test]
    fn window_size_parse_rejects_garbage() {
        assert_eq!(WindowSize::parse(b"120"), None);
        assert_eq!(WindowSize::parse(b"a,b"), None);
        assert_eq!(WindowSize::parse(&[0xFF, b',', b'1']), None);
    }
}
