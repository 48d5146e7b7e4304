//! Client → public port → LAN target mapping.
//!
//! The relay loads a JSON document of the form
//!
//! ```json
//! [
//!   {
//!     "name": "office",
//!     "clientKey": "0b1f8e6a2c9d4f7e",
//!     "proxyMappings": [
//!       { "inetPort": 8080, "lan": "192.168.1.20:80", "name": "intranet web" }
//!     ]
//!   }
//! ]
//! ```
//!
//! [`MappingTable`] is an immutable, validated snapshot with lookup indexes.
//! [`MappingStore`] owns the live snapshot, persists updates and notifies
//! subscribers through a `watch` channel.

use crate::error::{Result, TunnelError};
use lanbridge_protocol::constants::URI_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMapping {
    /// Public port on the relay
    pub inet_port: u16,
    /// `host:port` of the backend inside the client's network
    pub lan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub client_key: String,
    #[serde(default)]
    pub proxy_mappings: Vec<ProxyMapping>,
}

/// Validated mapping snapshot
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    clients: Vec<ClientMapping>,
    by_key: HashMap<String, usize>,
    /// inet port → (client index, mapping index)
    by_port: HashMap<u16, (usize, usize)>,
}

impl MappingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the lookup indexes, rejecting duplicate keys, duplicate
    /// ports and malformed LAN targets.
    pub fn from_clients(clients: Vec<ClientMapping>) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(clients.len());
        let mut by_port = HashMap::new();

        for (ci, client) in clients.iter().enumerate() {
            if client.client_key.is_empty() {
                return Err(TunnelError::Config("clientKey must not be empty".into()));
            }
            if client.client_key.contains(URI_SEPARATOR) {
                return Err(TunnelError::Config(format!(
                    "clientKey must not contain '{URI_SEPARATOR}': {}",
                    client.client_key
                )));
            }
            if by_key.insert(client.client_key.clone(), ci).is_some() {
                return Err(TunnelError::Config(format!(
                    "duplicate clientKey: {}",
                    client.client_key
                )));
            }
            for (mi, mapping) in client.proxy_mappings.iter().enumerate() {
                if mapping.inet_port == 0 {
                    return Err(TunnelError::Config("inetPort must not be 0".into()));
                }
                validate_lan_target(&mapping.lan)?;
                if by_port.insert(mapping.inet_port, (ci, mi)).is_some() {
                    return Err(TunnelError::Config(format!(
                        "duplicate inetPort: {}",
                        mapping.inet_port
                    )));
                }
            }
        }

        Ok(Self {
            clients,
            by_key,
            by_port,
        })
    }

    pub fn parse(json: &str) -> Result<Self> {
        let clients: Vec<ClientMapping> = serde_json::from_str(json)?;
        Self::from_clients(clients)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.clients)?)
    }

    pub fn clients(&self) -> &[ClientMapping] {
        &self.clients
    }

    pub fn client_keys(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.client_key.as_str())
    }

    pub fn contains_client(&self, client_key: &str) -> bool {
        self.by_key.contains_key(client_key)
    }

    /// Public ports owned by a client, empty for unknown keys.
    pub fn client_inet_ports(&self, client_key: &str) -> Vec<u16> {
        self.by_key
            .get(client_key)
            .map(|&i| {
                self.clients[i]
                    .proxy_mappings
                    .iter()
                    .map(|m| m.inet_port)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn lan_target(&self, port: u16) -> Option<&str> {
        self.by_port
            .get(&port)
            .map(|&(ci, mi)| self.clients[ci].proxy_mappings[mi].lan.as_str())
    }

    pub fn client_key_for_port(&self, port: u16) -> Option<&str> {
        self.by_port
            .get(&port)
            .map(|&(ci, _)| self.clients[ci].client_key.as_str())
    }

    /// Every public port in the table, ascending.
    pub fn user_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.by_port.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

fn validate_lan_target(lan: &str) -> Result<()> {
    let valid = lan
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0));
    if valid {
        Ok(())
    } else {
        Err(TunnelError::Config(format!(
            "lan target must be host:port, got {lan:?}"
        )))
    }
}

/// Live mapping table with persistence and change notification
#[derive(Debug)]
pub struct MappingStore {
    path: Option<PathBuf>,
    tx: watch::Sender<Arc<MappingTable>>,
    write_lock: Mutex<()>,
}

impl MappingStore {
    /// In-memory store; updates are not persisted.
    pub fn new(table: MappingTable) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(table));
        Self {
            path: None,
            tx,
            write_lock: Mutex::new(()),
        }
    }

    /// Loads the document at `path`. A missing file yields an empty table
    /// that is written on the first update.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = match std::fs::read_to_string(&path) {
            Ok(json) if json.trim().is_empty() => MappingTable::empty(),
            Ok(json) => MappingTable::parse(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Mapping file not found, starting empty");
                MappingTable::empty()
            }
            Err(e) => return Err(e.into()),
        };

        let mut store = Self::new(table);
        store.path = Some(path);
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> Arc<MappingTable> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MappingTable>> {
        self.tx.subscribe()
    }

    /// Validates, persists and publishes a new JSON document.
    pub fn update_json(&self, json: &str) -> Result<Arc<MappingTable>> {
        self.update(MappingTable::parse(json)?)
    }

    pub fn update(&self, table: MappingTable) -> Result<Arc<MappingTable>> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TunnelError::InvalidState("mapping store lock poisoned".into()))?;

        if let Some(path) = &self.path {
            persist(path, &table)?;
        }

        let table = Arc::new(table);
        self.tx.send_replace(table.clone());
        info!(
            clients = table.clients().len(),
            ports = table.user_ports().len(),
            "Mapping table updated"
        );
        Ok(table)
    }
}

fn persist(path: &Path, table: &MappingTable) -> Result<()> {
    let json = table.to_json_pretty()?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
