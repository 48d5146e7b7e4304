//! Backend sessions the client is currently serving, keyed by user id.

use crate::connection::Connection;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Client-side map of user id → backend connection for live sessions
#[derive(Debug, Clone, Default)]
pub struct BackendSessions {
    sessions: Arc<DashMap<String, Arc<Connection>>>,
}

impl BackendSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, user_id: &str, backend: Arc<Connection>) {
        self.sessions.insert(user_id.to_string(), backend);
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.sessions.get(user_id).map(|b| b.value().clone())
    }

    /// Removes the session only if it still belongs to `backend`.
    pub fn remove(&self, user_id: &str, backend: &Connection) -> Option<Arc<Connection>> {
        self.sessions
            .remove_if(user_id, |_, b| b.id() == backend.id())
            .map(|(_, b)| b)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Tears down every session: bound tunnels and backends are closed
    /// after flushing what is already queued. Returns how many were closed.
    pub fn clear_all(&self) -> usize {
        let backends: Vec<_> = self.sessions.iter().map(|b| b.value().clone()).collect();
        self.sessions.clear();

        for backend in &backends {
            if let Some(tunnel) = backend.unbind() {
                let _ = tunnel.unbind();
                tunnel.close();
            }
            backend.close();
        }
        if !backends.is_empty() {
            debug!(count = backends.len(), "Closed backend sessions");
        }
        backends.len()
    }
}
