//! Message model shared by every `CourseChat` component.
//!
//! A conversation's visible list is built from two kinds of records:
//! confirmed [`Message`]s carrying a server-assigned [`MessageId`], and
//! locally originated [`PendingMessage`]s keyed by a client-generated
//! [`TempId`]. Both sort by creation time with a lexical id tiebreak.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum message length in Unicode code points.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Default length of a reply preview excerpt in Unicode code points.
pub const REPLY_EXCERPT_CHARS: usize = 100;

/// Text rendered for an author whose display name is not resolved yet.
pub const PLACEHOLDER_NAME: &str = "Loading…";

/// Server-assigned message identifier. Opaque and stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a channel or direct-message thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a conversation identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Numeric user identifier as stored by the backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    /// Wraps a numeric user id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw numeric id.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated key for a message that has no server id yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId(Uuid);

impl TempId {
    /// Creates a new time-ordered temporary id (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `TempId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff_millis(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// An author's display name, possibly not resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DisplayName {
    /// Lookup pending; rendered as [`PLACEHOLDER_NAME`].
    #[default]
    Placeholder,
    /// Resolved from the directory service.
    Known(String),
}

impl DisplayName {
    /// Returns `true` once the name has been resolved.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    /// Text to render for this name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Placeholder => PLACEHOLDER_NAME,
            Self::Known(name) => name,
        }
    }

    /// Adopts `incoming` unless it would downgrade a resolved name.
    pub fn merge_from(&mut self, incoming: Self) {
        if incoming.is_known() {
            *self = incoming;
        }
    }
}

impl std::fmt::Display for DisplayName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalized snapshot of the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPreview {
    /// Author of the replied-to message.
    pub author_id: UserId,
    /// Display name of that author.
    pub author_name: DisplayName,
    /// Truncated content of the replied-to message.
    pub excerpt: String,
}

impl ReplyPreview {
    /// Builds a preview, cutting `content` to `max_chars` code points.
    #[must_use]
    pub fn new(author_id: UserId, author_name: DisplayName, content: &str, max_chars: usize) -> Self {
        Self {
            author_id,
            author_name,
            excerpt: excerpt(content, max_chars),
        }
    }

    /// Merges a later preview without losing a resolved author name.
    pub fn merge_from(&mut self, incoming: Self) {
        self.author_id = incoming.author_id;
        self.author_name.merge_from(incoming.author_name);
        if !incoming.excerpt.is_empty() {
            self.excerpt = incoming.excerpt;
        }
    }
}

/// Truncates `content` to `max_chars` code points, appending an ellipsis when cut.
#[must_use]
pub fn excerpt(content: &str, max_chars: usize) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Opaque file descriptor attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Storage reference understood by the attachment service.
    pub file_ref: String,
    /// Original file name.
    pub name: String,
    /// MIME type, when known.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Size in bytes, when known.
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Aggregated reactions for one emoji.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    /// The emoji (unicode or shortcode).
    pub emoji: String,
    /// Number of users who reacted.
    pub count: u32,
    /// Users who reacted.
    pub user_ids: Vec<UserId>,
}

/// A server-confirmed chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned id.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author's user id.
    pub author_id: UserId,
    /// Author's display name (enriched asynchronously).
    pub author_name: DisplayName,
    /// UTF-8 text content.
    pub content: String,
    /// Server creation time. Sort key and pagination cursor.
    pub created_at: Timestamp,
    /// Last edit time, if edited.
    pub edited_at: Option<Timestamp>,
    /// Message this one replies to.
    pub reply_to_id: Option<MessageId>,
    /// Snapshot of the replied-to message (enriched asynchronously).
    pub reply_preview: Option<ReplyPreview>,
    /// Attached files.
    pub attachments: Vec<Attachment>,
    /// Reactions grouped by emoji.
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Returns `true` if a reply preview should still be resolved.
    #[must_use]
    pub fn needs_reply_preview(&self) -> bool {
        self.reply_to_id.is_some()
            && self
                .reply_preview
                .as_ref()
                .is_none_or(|preview| !preview.author_name.is_known())
    }

    /// Shallow-merges a newer copy of the same message.
    ///
    /// Identity fields (`id`, `conversation_id`, `author_id`, `created_at`)
    /// are kept. Resolved names and previews are never replaced by
    /// placeholders or absent values.
    pub fn merge_from(&mut self, incoming: Self) {
        self.author_name.merge_from(incoming.author_name);
        self.content = incoming.content;
        self.edited_at = incoming.edited_at.or(self.edited_at);
        self.reply_to_id = incoming.reply_to_id;
        match (&mut self.reply_preview, incoming.reply_preview) {
            (Some(current), Some(next)) => current.merge_from(next),
            (slot @ None, Some(next)) => *slot = Some(next),
            (_, None) => {}
        }
        self.attachments = incoming.attachments;
        self.reactions = incoming.reactions;
    }

    /// Applies an enrichment patch in place.
    pub fn apply_enrichment(&mut self, patch: &Enrichment) {
        if let Some(name) = &patch.author_name {
            self.author_name.merge_from(name.clone());
        }
        if let Some(preview) = &patch.reply_preview {
            match &mut self.reply_preview {
                Some(current) => current.merge_from(preview.clone()),
                None => self.reply_preview = Some(preview.clone()),
            }
        }
    }

    /// Flips `user`'s membership in the `emoji` reaction.
    ///
    /// Returns `true` if the user now reacts with `emoji`.
    pub fn toggle_reaction(&mut self, emoji: &str, user: UserId) -> bool {
        let Some(index) = self.reactions.iter().position(|r| r.emoji == emoji) else {
            self.reactions.push(Reaction {
                emoji: emoji.to_string(),
                count: 1,
                user_ids: vec![user],
            });
            return true;
        };

        let reaction = &mut self.reactions[index];
        let added = if let Some(pos) = reaction.user_ids.iter().position(|u| *u == user) {
            reaction.user_ids.remove(pos);
            reaction.count = reaction.count.saturating_sub(1);
            false
        } else {
            reaction.user_ids.push(user);
            reaction.count = reaction.count.saturating_add(1);
            true
        };
        if reaction.count == 0 {
            self.reactions.remove(index);
        }
        added
    }
}

/// A later, identity-preserving update to a visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    /// Message being enriched.
    pub message_id: MessageId,
    /// Resolved author name, if any.
    pub author_name: Option<DisplayName>,
    /// Resolved reply preview, if any.
    pub reply_preview: Option<ReplyPreview>,
}

impl Enrichment {
    /// Returns `true` if the patch carries nothing to apply.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.author_name.is_none() && self.reply_preview.is_none()
    }
}

/// Delivery state of a locally originated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    /// A send attempt is in flight.
    Sending,
    /// The last attempt failed; content is kept for retry.
    Failed {
        /// Human-readable failure reason.
        error: String,
    },
}

/// A message shown locally before server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Client-generated key.
    pub temp_id: TempId,
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Local user.
    pub author_id: UserId,
    /// Local user's display name as currently cached.
    pub author_name: DisplayName,
    /// Text as submitted.
    pub content: String,
    /// Client submission time.
    pub created_at: Timestamp,
    /// Message this one replies to.
    pub reply_to_id: Option<MessageId>,
    /// Snapshot of the replied-to message.
    pub reply_preview: Option<ReplyPreview>,
    /// Delivery state.
    pub state: PendingState,
}

impl PendingMessage {
    /// Returns `true` if the last send attempt failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.state, PendingState::Failed { .. })
    }
}

/// Error returned when outgoing content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty after trimming whitespace.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds [`MAX_CONTENT_CHARS`].
    #[error("message too long ({chars} characters, max {max})")]
    TooLong {
        /// Actual length in code points.
        chars: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

/// Validates outgoing message content.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank content or
/// [`ValidationError::TooLong`] past [`MAX_CONTENT_CHARS`] code points.
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let chars = content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(ValidationError::TooLong {
            chars,
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(())
}
