use serde::{Deserialize, Serialize};

/// Opaque ID types for type safety
pub type ConnectionId = String;
pub type GroupId = String;
pub type MessageId = String;

/// Identity of a message author, carried through the relay unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorRef {
    pub id: String,
    pub display_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A chat message relayed to group members.
///
/// Messages are authored and persisted upstream; the relay never validates,
/// stores, or mutates their content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub content: String,
    /// ISO8601 creation timestamp, set by the authoring path
    pub created_at: String,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub edited_at: Option<String>,
    pub author: AuthorRef,
}

/// Typing-presence change handed to client handlers. Transient: each
/// start/stop is an independent event, nothing is stored or de-duplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingEvent {
    pub author: String,
    pub is_typing: bool,
}
