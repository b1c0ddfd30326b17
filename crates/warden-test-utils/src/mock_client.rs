//! Mock client transport backed by in-memory channels.
//!
//! The broker side holds a [`MockClientTransport`]; the test holds the
//! [`MockPeer`] and plays the role of the browser: it scripts inbound frames
//! and observes everything the engine sends.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use warden_core::error::{Error, Result};
use warden_core::transport::ClientTransport;

/// Broker-side half of an in-memory transport.
pub struct MockClientTransport {
    rx: Mutex<mpsc::Receiver<Bytes>>,
    tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
}

/// Test-side half: scripts client frames and observes engine output.
pub struct MockPeer {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

/// Create a connected transport pair.
pub fn mock_transport_pair() -> (MockClientTransport, MockPeer) {
    let (client_tx, broker_rx) = mpsc::channel(64);
    let (broker_tx, client_rx) = mpsc::channel(64);

    (
        MockClientTransport {
            rx: Mutex::new(broker_rx),
            tx: broker_tx,
            closed: AtomicBool::new(false),
        },
        MockPeer {
            tx: client_tx,
            rx: Mutex::new(client_rx),
        },
    )
}

#[async_trait]
impl ClientTransport for MockClientTransport {
    async fn recv(&self) -> Result<Bytes> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.tx
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MockPeer {
    /// Script a frame arriving from the client.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next frame the engine sent to this client, if any arrives.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    /// Drain currently buffered engine output without waiting.
    pub async fn drain(&self) -> Vec<Bytes> {
        let mut rx = self.rx.lock().await;
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Collect engine output until `pattern` shows up or `timeout` passes.
    pub async fn wait_for(
        &self,
        pattern: &[u8],
        timeout: std::time::Duration,
    ) -> Option<Vec<u8>> {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            let frame = {
                let mut rx = self.rx.lock().await;
                tokio::time::timeout(remaining, rx.recv()).await
            };
            match frame {
                Ok(Some(frame)) => {
                    collected.extend_from_slice(&frame);
                    if collected
                        .windows(pattern.len().max(1))
                        .any(|w| w == pattern)
                    {
                        return Some(collected);
                    }
                }
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Simulate the client going away.
    pub fn disconnect(self) {}
}
