//! Read model handed to the UI layer.

use coursechat_proto::message::{
    ConversationId, DisplayName, Message, MessageId, PendingMessage, TempId, Timestamp, UserId,
};

use crate::error::ChatError;

/// Load state of the active conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPhase {
    /// No conversation, or the initial page failed to load.
    #[default]
    Empty,
    /// A history page is in flight.
    Loading,
    /// At least one history page has been applied.
    Ready,
}

/// One row of the visible list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEntry {
    /// A server-confirmed message.
    Confirmed(Message),
    /// A local message still sending, or failed and awaiting retry.
    Pending(PendingMessage),
}

impl ViewEntry {
    /// Sort timestamp (server time, or client submission time when pending).
    #[must_use]
    pub const fn created_at(&self) -> Timestamp {
        match self {
            Self::Confirmed(m) => m.created_at,
            Self::Pending(p) => p.created_at,
        }
    }

    /// Author of the row.
    #[must_use]
    pub const fn author_id(&self) -> UserId {
        match self {
            Self::Confirmed(m) => m.author_id,
            Self::Pending(p) => p.author_id,
        }
    }

    /// Author name as currently resolved.
    #[must_use]
    pub const fn author_name(&self) -> &DisplayName {
        match self {
            Self::Confirmed(m) => &m.author_name,
            Self::Pending(p) => &p.author_name,
        }
    }

    /// Text content.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Confirmed(m) => &m.content,
            Self::Pending(p) => &p.content,
        }
    }

    /// Server id, if confirmed.
    #[must_use]
    pub const fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Confirmed(m) => Some(&m.id),
            Self::Pending(_) => None,
        }
    }

    /// Temporary id, if pending.
    #[must_use]
    pub const fn temp_id(&self) -> Option<TempId> {
        match self {
            Self::Confirmed(_) => None,
            Self::Pending(p) => Some(p.temp_id),
        }
    }

    /// The confirmed message, if any.
    #[must_use]
    pub const fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Confirmed(m) => Some(m),
            Self::Pending(_) => None,
        }
    }

    /// The pending message, if any.
    #[must_use]
    pub const fn as_pending(&self) -> Option<&PendingMessage> {
        match self {
            Self::Confirmed(_) => None,
            Self::Pending(p) => Some(p),
        }
    }

    /// Returns `true` for a pending row whose last attempt failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        match self {
            Self::Confirmed(_) => false,
            Self::Pending(p) => p.is_failed(),
        }
    }

    /// `(created_at, id)` ordering key. Pending rows use their temp id.
    #[must_use]
    pub fn sort_key(&self) -> (Timestamp, String) {
        match self {
            Self::Confirmed(m) => (m.created_at, m.id.as_str().to_string()),
            Self::Pending(p) => (p.created_at, p.temp_id.to_string()),
        }
    }
}

/// Snapshot of one conversation as the UI should render it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationView {
    /// Active conversation, if any.
    pub conversation_id: Option<ConversationId>,
    /// Rows sorted by `(created_at, id)` ascending.
    pub entries: Vec<ViewEntry>,
    /// Whether older pages may exist.
    pub has_more_history: bool,
    /// Whether a history page is in flight.
    pub is_loading_history: bool,
    /// Load state.
    pub phase: LoadPhase,
    /// Most recent history error, cleared by the next successful page.
    pub last_error: Option<ChatError>,
}

impl ConversationView {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds a confirmed message by id.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.entries
            .iter()
            .filter_map(ViewEntry::as_message)
            .find(|m| m.id == *id)
    }

    /// Finds a pending message by temp id.
    #[must_use]
    pub fn pending(&self, temp_id: &TempId) -> Option<&PendingMessage> {
        self.entries
            .iter()
            .filter_map(ViewEntry::as_pending)
            .find(|p| p.temp_id == *temp_id)
    }

    /// Number of pending rows (sending or failed).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ViewEntry::Pending(_)))
            .count()
    }

    /// Row contents in display order.
    #[must_use]
    pub fn contents(&self) -> Vec<&str> {
        self.entries.iter().map(ViewEntry::content).collect()
    }

    /// Confirmed ids in display order.
    #[must_use]
    pub fn message_ids(&self) -> Vec<&MessageId> {
        self.entries.iter().filter_map(ViewEntry::message_id).collect()
    }

    /// Returns `true` if rows are in `(created_at, id)` order.
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].sort_key() <= pair[1].sort_key())
    }
}
