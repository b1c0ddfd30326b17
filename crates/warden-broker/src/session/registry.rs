//! Online-session registry.
//!
//! Process-wide shared state mapping session id to live session. Created at
//! process start and injected wherever needed; inserts happen once at
//! successful connect, deletes once at teardown, after final persistence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::Session;

/// Registry of live sessions.
#[derive(Default)]
pub struct OnlineSessions {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl OnlineSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        let id = session.id().to_string();
        self.sessions.write().await.insert(id.clone(), session);
        debug!(session_id = %id, "Session registered");
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            debug!(session_id, "Session deregistered");
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
