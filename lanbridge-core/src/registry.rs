//! Relay-side registry of authenticated clients and their user sessions.

use crate::connection::Connection;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lanbridge_common::{MappingTable, TunnelError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client key already registered: {0}")]
    DuplicateClientKey(String),
    #[error("client key not registered: {0}")]
    UnknownClient(String),
}

impl From<RegistryError> for TunnelError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateClientKey(key) => TunnelError::DuplicateClientKey(key),
            RegistryError::UnknownClient(key) => TunnelError::Registry(key),
        }
    }
}

type UserMap = Arc<DashMap<String, Arc<Connection>>>;

#[derive(Debug)]
struct ClientEntry {
    control: Arc<Connection>,
    ports: Vec<u16>,
    users: UserMap,
}

/// Maps a client key to its single live control channel, the public ports
/// it owns and the user sessions pending or bound under it.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<String, ClientEntry>,
    ports: DashMap<u16, String>,
    next_user_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel` as the control channel for `client_key`.
    ///
    /// A second registration for a live key is refused and leaves the
    /// existing entry untouched.
    pub fn register_control_channel(
        &self,
        client_key: &str,
        ports: Vec<u16>,
        channel: Arc<Connection>,
    ) -> Result<(), RegistryError> {
        match self.clients.entry(client_key.to_string()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateClientKey(client_key.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(ClientEntry {
                    control: channel,
                    ports: ports.clone(),
                    users: Arc::new(DashMap::new()),
                });
            }
        }
        for port in ports {
            self.ports.insert(port, client_key.to_string());
        }
        info!(client_key, "Control channel registered");
        Ok(())
    }

    pub fn lookup_control_channel(&self, client_key: &str) -> Option<Arc<Connection>> {
        self.clients.get(client_key).map(|e| e.control.clone())
    }

    /// Resolves a public port to its owner's key and control channel.
    pub fn lookup_by_port(&self, port: u16) -> Option<(String, Arc<Connection>)> {
        let key = self.ports.get(&port).map(|k| k.value().clone())?;
        let control = self.lookup_control_channel(&key)?;
        Some((key, control))
    }

    /// Removes the registration owned by `channel`, closing every user
    /// connection under the key and every tunnel bound to one.
    ///
    /// Returns false if `channel` is not the registered control channel.
    pub fn unregister(&self, channel: &Connection) -> bool {
        let Some(client_key) = channel.client_key() else {
            return false;
        };
        let Some((client_key, entry)) = self
            .clients
            .remove_if(&client_key, |_, e| e.control.id() == channel.id())
        else {
            return false;
        };

        for port in &entry.ports {
            self.ports.remove_if(port, |_, owner| *owner == client_key);
        }

        let users: Vec<_> = entry.users.iter().map(|u| u.value().clone()).collect();
        entry.users.clear();
        for user in &users {
            if let Some(tunnel) = user.unbind() {
                let _ = tunnel.unbind();
                tunnel.close();
            }
            user.close();
        }

        info!(
            client_key = %client_key,
            users = users.len(),
            "Control channel unregistered"
        );
        true
    }

    pub fn bind_user_session(
        &self,
        client_key: &str,
        user_id: &str,
        user: Arc<Connection>,
    ) -> Result<(), RegistryError> {
        let users = self.users(client_key)?;
        users.insert(user_id.to_string(), user);
        debug!(client_key, user_id, "User session pending");
        Ok(())
    }

    pub fn resolve_user_session(&self, client_key: &str, user_id: &str) -> Option<Arc<Connection>> {
        let users = self.users(client_key).ok()?;
        let user = users.get(user_id).map(|u| u.value().clone());
        user
    }

    pub fn remove_user_session(&self, client_key: &str, user_id: &str) -> Option<Arc<Connection>> {
        let users = self.users(client_key).ok()?;
        let removed = users.remove(user_id).map(|(_, u)| u);
        removed
    }

    fn users(&self, client_key: &str) -> Result<UserMap, RegistryError> {
        self.clients
            .get(client_key)
            .map(|e| e.users.clone())
            .ok_or_else(|| RegistryError::UnknownClient(client_key.to_string()))
    }

    /// Process-unique user id.
    pub fn next_user_id(&self) -> u64 {
        self.next_user_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_keys(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_online(&self, client_key: &str) -> bool {
        self.clients.contains_key(client_key)
    }

    pub fn user_count(&self, client_key: &str) -> usize {
        self.users(client_key).map_or(0, |u| u.len())
    }

    /// Snapshot of the user connections pending or bound under a key.
    pub fn user_sessions(&self, client_key: &str) -> Vec<Arc<Connection>> {
        self.users(client_key)
            .map(|users| users.iter().map(|u| u.value().clone()).collect())
            .unwrap_or_default()
    }

    pub fn ports_of(&self, client_key: &str) -> Vec<u16> {
        self.clients
            .get(client_key)
            .map(|e| e.ports.clone())
            .unwrap_or_default()
    }

    /// Applies a new mapping table: clients whose key disappeared are
    /// disconnected, the others get their port ownership refreshed.
    pub fn apply_mappings(&self, table: &MappingTable) {
        let mut removed = Vec::new();
        for key in self.client_keys() {
            if !table.contains_client(&key) {
                if let Some(control) = self.lookup_control_channel(&key) {
                    removed.push(control);
                }
                continue;
            }
            let ports = table.client_inet_ports(&key);
            let old = match self.clients.get_mut(&key) {
                Some(mut entry) => std::mem::replace(&mut entry.ports, ports.clone()),
                None => continue,
            };
            for port in old {
                self.ports.remove_if(&port, |_, owner| *owner == key);
            }
            for port in ports {
                self.ports.insert(port, key.clone());
            }
        }

        for control in removed {
            info!(conn_id = control.id(), "Client key removed from mapping, closing");
            control.close();
        }
    }
}
