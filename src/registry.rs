//! Connection bookkeeping: which connections exist and which groups each
//! belongs to. The registry is the single source of truth for both; the hub
//! layers the group -> member mapping on top of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::ServerEvent;
use crate::types::{ConnectionId, GroupId};

#[derive(Debug, Error)]
pub enum RegistryError {
    /// An operation referenced a connection the registry does not know
    /// about, e.g. a request racing against its own disconnect.
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),
}

struct ConnectionEntry {
    sender: mpsc::Sender<ServerEvent>,
    groups: HashSet<GroupId>,
}

/// Tracks every live connection together with its outbound event channel.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. Registering an id that is already live is
    /// a no-op; the original sender stays installed.
    pub async fn register(&self, id: &str, sender: mpsc::Sender<ServerEvent>) {
        let mut connections = self.connections.write().await;
        connections
            .entry(id.to_string())
            .or_insert_with(|| ConnectionEntry {
                sender,
                groups: HashSet::new(),
            });
    }

    /// Remove a connection and hand back the groups it belonged to so the
    /// caller can scrub its member sets. Safe to call repeatedly; unknown
    /// ids yield an empty set.
    pub async fn unregister(&self, id: &str) -> HashSet<GroupId> {
        let mut connections = self.connections.write().await;
        connections
            .remove(id)
            .map(|entry| entry.groups)
            .unwrap_or_default()
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Record a group membership. No-op if already a member.
    pub async fn add_membership(&self, id: &str, group: &str) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        match connections.get_mut(id) {
            Some(entry) => {
                entry.groups.insert(group.to_string());
                Ok(())
            }
            None => Err(RegistryError::NotRegistered(id.to_string())),
        }
    }

    /// Drop a group membership. No-op if the connection is unknown or was
    /// never a member.
    pub async fn remove_membership(&self, id: &str, group: &str) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(id) {
            entry.groups.remove(group);
        }
    }

    /// Snapshot the outbound senders for a set of connections. Ids that are
    /// no longer registered are skipped; the hub treats them as already
    /// disconnected.
    pub async fn senders(
        &self,
        ids: &HashSet<ConnectionId>,
    ) -> Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> {
        let connections = self.connections.read().await;
        ids.iter()
            .filter_map(|id| {
                connections
                    .get(id)
                    .map(|entry| (id.clone(), entry.sender.clone()))
            })
            .collect()
    }
}
