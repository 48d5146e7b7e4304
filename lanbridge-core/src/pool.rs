//! Client-side pool of idle tunnel connections.

use crate::connection::Connection;
use async_trait::async_trait;
use lanbridge_common::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Opens a fresh tunnel connection to the relay.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial_tunnel(&self) -> Result<Arc<Connection>>;
}

/// FIFO of reusable tunnels, capped at `capacity` idle entries.
#[derive(Debug)]
pub struct TunnelPool {
    idle: Mutex<VecDeque<Arc<Connection>>>,
    capacity: usize,
}

impl TunnelPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity.min(16))),
            capacity,
        }
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<Arc<Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the oldest open idle tunnel, or dials a new one.
    pub async fn borrow(&self, dialer: &dyn TunnelDialer) -> Result<Arc<Connection>> {
        let pooled = {
            let mut idle = self.idle();
            let mut found = None;
            while let Some(conn) = idle.pop_front() {
                if !conn.is_closed() {
                    found = Some(conn);
                    break;
                }
            }
            found
        };
        self.publish_idle();

        match pooled {
            Some(conn) => {
                debug!(conn_id = conn.id(), "Reusing pooled tunnel");
                Ok(conn)
            }
            None => dialer.dial_tunnel().await,
        }
    }

    /// Returns a tunnel whose session ended. Closed tunnels are dropped and
    /// tunnels beyond capacity are closed.
    pub fn give_back(&self, conn: Arc<Connection>) {
        if conn.is_closed() {
            return;
        }
        let _ = conn.unbind();
        {
            let mut idle = self.idle();
            if idle.len() >= self.capacity {
                drop(idle);
                debug!(conn_id = conn.id(), "Tunnel pool full, closing");
                conn.close();
                return;
            }
            conn.set_auto_read(true);
            idle.push_back(conn);
        }
        self.publish_idle();
    }

    /// Forgets a tunnel without closing it.
    pub fn remove(&self, conn: &Connection) {
        self.idle().retain(|c| c.id() != conn.id());
        self.publish_idle();
    }

    /// Closes and forgets every idle tunnel.
    pub fn clear(&self) {
        let drained: Vec<_> = self.idle().drain(..).collect();
        for conn in drained {
            conn.close();
        }
        self.publish_idle();
    }

    pub fn len(&self) -> usize {
        self.idle().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(feature = "metrics")]
    fn publish_idle(&self) {
        lanbridge_observability::relay_metrics()
            .tunnel_pool_idle
            .set(self.len() as i64);
    }

    #[cfg(not(feature = "metrics"))]
    fn publish_idle(&self) {}
}
