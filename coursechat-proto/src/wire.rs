//! JSON rows exchanged with the hosted backend.
//!
//! The backend exposes messages as flat table rows keyed by a numeric
//! `user_id`. History pages arrive newest-first; push frames follow the
//! `INSERT` / `UPDATE` / `DELETE` shape of a row-level change feed.

use serde::{Deserialize, Serialize};

use crate::message::{
    Attachment, ConversationId, DisplayName, Message, MessageId, Reaction, Timestamp, UserId,
};

/// One `messages` table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Server-assigned id.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author's numeric id.
    pub user_id: UserId,
    /// Text content.
    pub content: String,
    /// Creation time in ms since epoch.
    pub created_at: Timestamp,
    /// Last edit time.
    #[serde(default)]
    pub edited_at: Option<Timestamp>,
    /// Replied-to message.
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    /// Attached files.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Reaction aggregates.
    #[serde(default)]
    pub reactions: Vec<ReactionRow>,
}

/// Reaction aggregate as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRow {
    /// The emoji.
    pub emoji: String,
    /// Users who reacted.
    #[serde(default)]
    pub user_ids: Vec<UserId>,
    /// Explicit count; derived from `user_ids` when absent.
    #[serde(default)]
    pub count: Option<u32>,
}

impl MessageRow {
    /// Normalizes a row into a [`Message`] with the given author name.
    #[must_use]
    pub fn into_message(self, author_name: DisplayName) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            author_id: self.user_id,
            author_name,
            content: self.content,
            created_at: self.created_at,
            edited_at: self.edited_at,
            reply_to_id: self.reply_to_id,
            reply_preview: None,
            attachments: self.attachments,
            reactions: self
                .reactions
                .into_iter()
                .map(|row| Reaction {
                    count: row
                        .count
                        .unwrap_or_else(|| u32::try_from(row.user_ids.len()).unwrap_or(u32::MAX)),
                    emoji: row.emoji,
                    user_ids: row.user_ids,
                })
                .collect(),
        }
    }
}

/// Body of a history page response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageBody {
    /// Rows ordered newest-first.
    pub messages: Vec<MessageRow>,
    /// Whether older rows exist. Absent on some backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
}

/// Primary-key-only row carried by delete frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRow {
    /// Deleted message id.
    pub id: MessageId,
}

/// One frame of the row-level change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum PushFrame {
    /// A row was inserted.
    Insert {
        /// The new row.
        record: MessageRow,
    },
    /// A row was updated.
    Update {
        /// The row after the update.
        record: MessageRow,
    },
    /// A row was deleted.
    Delete {
        /// Key of the removed row.
        old_record: KeyRow,
    },
}

impl PushFrame {
    /// Conversation the frame belongs to, when the frame carries one.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Insert { record } | Self::Update { record } => Some(&record.conversation_id),
            Self::Delete { .. } => None,
        }
    }
}

/// Request body for sending a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Sending user.
    pub user_id: UserId,
    /// Text content.
    pub content: String,
    /// Replied-to message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

/// Directory entry for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// The user's id.
    pub user_id: UserId,
    /// Name shown next to their messages.
    pub display_name: String,
    /// Avatar storage reference.
    #[serde(default)]
    pub avatar_ref: Option<String>,
}
