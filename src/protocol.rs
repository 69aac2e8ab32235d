use crate::types::{ChatMessage, GroupId, MessageId};
use serde::{Deserialize, Serialize};

/// Requests a client sends over the wire. No structured response beyond
/// protocol-level success or an `Error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinGroup {
        group_id: GroupId,
    },
    LeaveGroup {
        group_id: GroupId,
    },
    SendMessage {
        group_id: GroupId,
        message: ChatMessage,
    },
    UserTyping {
        group_id: GroupId,
        author_identity: String,
    },
    UserStoppedTyping {
        group_id: GroupId,
        author_identity: String,
    },
    /// Notification-only; carries no authorization check.
    DeleteMessage {
        group_id: GroupId,
        message_id: MessageId,
    },
}

/// Events the server pushes to connected clients. None of these correlate
/// with a specific client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        message: ChatMessage,
    },
    UserTyping {
        author_identity: String,
    },
    UserStoppedTyping {
        author_identity: String,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    Error {
        code: String,
        msg: String,
    },
}
