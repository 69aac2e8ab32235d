//! Group membership and fan-out.
//!
//! The hub owns the group -> member-set mapping and delivers events to every
//! current member of a group. Groups have no create/destroy step: a member
//! set appears on first join and is dropped when its last member leaves or
//! disconnects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::protocol::ServerEvent;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::types::{ChatMessage, ConnectionId, GroupId};

/// Server-side broadcast hub. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct Hub {
    registry: ConnectionRegistry,
    groups: Arc<RwLock<HashMap<GroupId, HashSet<ConnectionId>>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Track a newly established connection and its outbound channel.
    pub async fn connect(&self, id: &str, sender: mpsc::Sender<ServerEvent>) {
        self.registry.register(id, sender).await;
    }

    /// Remove a connection from the registry and from every group it was a
    /// member of. Broadcasts computed after this returns will not include
    /// the connection. Safe to call more than once.
    pub async fn disconnect(&self, id: &str) {
        // Lock order everywhere is groups before registry.
        let mut groups = self.groups.write().await;
        let joined = self.registry.unregister(id).await;
        for group in joined {
            if let Some(members) = groups.get_mut(&group) {
                members.remove(id);
                if members.is_empty() {
                    groups.remove(&group);
                }
            }
        }
    }

    /// Add a connection to a group. Idempotent; fails only when the
    /// connection is not registered.
    pub async fn join(&self, id: &str, group: &str) -> Result<(), RegistryError> {
        let mut groups = self.groups.write().await;
        self.registry.add_membership(id, group).await?;
        groups
            .entry(group.to_string())
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    /// Remove a connection from a group. Safe if it was never a member.
    pub async fn leave(&self, id: &str, group: &str) {
        let mut groups = self.groups.write().await;
        self.registry.remove_membership(id, group).await;
        if let Some(members) = groups.get_mut(group) {
            members.remove(id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    pub async fn member_count(&self, group: &str) -> usize {
        self.groups
            .read()
            .await
            .get(group)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Deliver a chat message to every current member of `group`, sender
    /// included. The relay passes the message through untouched.
    pub async fn broadcast_message(&self, group: &str, message: ChatMessage) {
        self.broadcast(group, ServerEvent::ReceiveMessage { message })
            .await;
    }

    /// Fan out a typing-presence change. Stateless: nothing is stored, no
    /// stop event is ever synthesized for a stale start.
    pub async fn broadcast_typing(&self, group: &str, author_identity: &str, is_typing: bool) {
        let event = if is_typing {
            ServerEvent::UserTyping {
                author_identity: author_identity.to_string(),
            }
        } else {
            ServerEvent::UserStoppedTyping {
                author_identity: author_identity.to_string(),
            }
        };
        self.broadcast(group, event).await;
    }

    /// Notify every member of `group` that a message was deleted.
    pub async fn broadcast_deletion(&self, group: &str, message_id: &str) {
        self.broadcast(
            group,
            ServerEvent::MessageDeleted {
                message_id: message_id.to_string(),
            },
        )
        .await;
    }

    /// Fan-out core: snapshot the member set at call time, then deliver to
    /// each member independently. A recipient whose queue is full or gone
    /// is logged and skipped; it never delays or aborts the others.
    async fn broadcast(&self, group: &str, event: ServerEvent) {
        let members = {
            let groups = self.groups.read().await;
            match groups.get(group) {
                Some(members) => members.clone(),
                None => return,
            }
        };

        let recipients = self.registry.senders(&members).await;
        for (id, sender) in recipients {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(connection = %id, group, "outbound queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(connection = %id, group, "connection gone mid-broadcast");
                }
            }
        }
    }
}
