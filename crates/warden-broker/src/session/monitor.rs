//! Passive monitor fan-out.
//!
//! Any number of read-only viewers may attach to a live session. Every
//! flushed output chunk is written to each of them; a failing or closed
//! viewer is skipped and never disturbs the primary session or the other
//! viewers. Attach and detach race freely with the engine's writes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use warden_core::transport::ClientTransport;

/// The set of viewer transports attached to one session.
pub struct Monitors {
    viewers: RwLock<HashMap<String, Arc<dyn ClientTransport>>>,
}

impl Monitors {
    pub fn new() -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn attach(&self, key: &str, viewer: Arc<dyn ClientTransport>) {
        self.viewers
            .write()
            .await
            .insert(key.to_string(), viewer);
        debug!(key, "Monitor attached");
    }

    pub async fn detach(&self, key: &str) {
        if self.viewers.write().await.remove(key).is_some() {
            debug!(key, "Monitor detached");
        }
    }

    pub async fn count(&self) -> usize {
        self.viewers.read().await.len()
    }

    pub async fn has_any(&self) -> bool {
        !self.viewers.read().await.is_empty()
    }

    /// Best-effort write to every viewer. Failures are skipped.
    pub async fn broadcast(&self, frame: &[u8]) {
        let viewers: Vec<Arc<dyn ClientTransport>> =
            self.viewers.read().await.values().cloned().collect();
        for viewer in viewers {
            let _ = viewer.send(frame).await;
        }
    }

    /// Notify every viewer that the session ended, then close them all.
    pub async fn close_all(&self, message: &str) {
        let viewers: Vec<(String, Arc<dyn ClientTransport>)> = self
            .viewers
            .write()
            .await
            .drain()
            .collect();
        for (key, viewer) in viewers {
            let _ = viewer.send(message.as_bytes()).await;
            viewer.close().await;
            debug!(key, "Monitor closed with session");
        }
    }
}

impl Default for Monitors {
    fn default() -> Self {
        Self::new()
    }
}
