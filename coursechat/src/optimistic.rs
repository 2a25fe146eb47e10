//! Lifecycle of locally originated messages.
//!
//! A [`PendingMessage`] is created on submit, then either promoted to a
//! confirmed [`Message`] (its [`TempId`] retired), or marked failed and kept
//! for retry. Dismissal removes it outright.
//!
//! Matching a pushed [`Message`] against outstanding pending entries goes
//! through the [`PendingMatcher`] trait so the heuristic can be swapped for
//! a stricter one (for example a client-generated idempotency key) without
//! touching the merge logic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use coursechat_proto::message::{
    ConversationId, DisplayName, Message, MessageId, PendingMessage, PendingState, ReplyPreview,
    TempId, Timestamp, UserId, validate_content,
};

use crate::error::ChatError;

/// Default window for the content/author/time heuristic.
pub const DEFAULT_MATCH_WINDOW: Duration = Duration::from_secs(15);

/// Decides whether a confirmed message is the server copy of a pending one.
pub trait PendingMatcher: Send + Sync + fmt::Debug {
    /// Returns `true` if `incoming` confirms `pending`.
    fn matches(&self, pending: &PendingMessage, incoming: &Message) -> bool;
}

/// Matches on equal author, equal trimmed content and creation times
/// closer than `window`.
///
/// Two identical messages sent by the same user inside the window can be
/// paired with the wrong pending entry. Both still resolve once their
/// server ids arrive.
#[derive(Debug, Clone, Copy)]
pub struct ContentWindowMatcher {
    window: Duration,
}

impl ContentWindowMatcher {
    /// Creates a matcher with a custom window.
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl Default for ContentWindowMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_WINDOW)
    }
}

impl PendingMatcher for ContentWindowMatcher {
    fn matches(&self, pending: &PendingMessage, incoming: &Message) -> bool {
        let window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
        pending.author_id == incoming.author_id
            && pending.content.trim() == incoming.content.trim()
            && pending.created_at.abs_diff_millis(incoming.created_at) < window_ms
    }
}

/// Validates `content` and builds a pending message stamped with the
/// current client time.
///
/// # Errors
///
/// Returns [`ChatError::Validation`] for empty or over-long content.
pub fn draft(
    conversation_id: ConversationId,
    author_id: UserId,
    author_name: DisplayName,
    content: &str,
    reply_to_id: Option<MessageId>,
    reply_preview: Option<ReplyPreview>,
) -> Result<PendingMessage, ChatError> {
    validate_content(content)?;
    Ok(PendingMessage {
        temp_id: TempId::new(),
        conversation_id,
        author_id,
        author_name,
        content: content.to_string(),
        created_at: Timestamp::now(),
        reply_to_id,
        reply_preview,
        state: PendingState::Sending,
    })
}

#[derive(Debug)]
struct Tracked {
    message: PendingMessage,
    attempts: u32,
}

/// Registry of pending messages in insertion order.
#[derive(Debug)]
pub struct OptimisticTracker {
    entries: Vec<Tracked>,
    matcher: Arc<dyn PendingMatcher>,
}

impl Default for OptimisticTracker {
    fn default() -> Self {
        Self::new(Arc::new(ContentWindowMatcher::default()))
    }
}

impl OptimisticTracker {
    /// Creates an empty tracker using `matcher` for push reconciliation.
    #[must_use]
    pub fn new(matcher: Arc<dyn PendingMatcher>) -> Self {
        Self {
            entries: Vec::new(),
            matcher,
        }
    }

    /// Registers a new pending message (first attempt in flight).
    ///
    /// Re-registering an existing id replaces it.
    pub fn create(&mut self, mut message: PendingMessage) -> TempId {
        let temp_id = message.temp_id;
        message.state = PendingState::Sending;
        if let Some(existing) = self.entries.iter_mut().find(|t| t.message.temp_id == temp_id) {
            existing.message = message;
        } else {
            self.entries.push(Tracked {
                message,
                attempts: 1,
            });
        }
        temp_id
    }

    /// Returns the pending message, if tracked.
    #[must_use]
    pub fn get(&self, temp_id: &TempId) -> Option<&PendingMessage> {
        self.entries
            .iter()
            .find(|t| t.message.temp_id == *temp_id)
            .map(|t| &t.message)
    }

    /// Mutable access for in-place enrichment.
    pub fn get_mut(&mut self, temp_id: &TempId) -> Option<&mut PendingMessage> {
        self.entries
            .iter_mut()
            .find(|t| t.message.temp_id == *temp_id)
            .map(|t| &mut t.message)
    }

    /// Number of send attempts started for `temp_id`.
    #[must_use]
    pub fn attempts(&self, temp_id: &TempId) -> Option<u32> {
        self.entries
            .iter()
            .find(|t| t.message.temp_id == *temp_id)
            .map(|t| t.attempts)
    }

    /// Moves a pending message to the failed state, keeping its content.
    ///
    /// Returns `false` if `temp_id` is no longer tracked (already confirmed
    /// or dismissed).
    pub fn mark_failed(&mut self, temp_id: &TempId, error: impl Into<String>) -> bool {
        match self.get_mut(temp_id) {
            Some(message) => {
                message.state = PendingState::Failed {
                    error: error.into(),
                };
                true
            }
            None => false,
        }
    }

    /// Starts a new attempt for a failed message.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RetryInFlight`] if an attempt is already
    /// running, or [`ChatError::UnknownPending`] if the id is not tracked.
    pub fn begin_retry(&mut self, temp_id: &TempId) -> Result<PendingMessage, ChatError> {
        let tracked = self
            .entries
            .iter_mut()
            .find(|t| t.message.temp_id == *temp_id)
            .ok_or(ChatError::UnknownPending(*temp_id))?;
        if tracked.message.state == PendingState::Sending {
            return Err(ChatError::RetryInFlight(*temp_id));
        }
        tracked.message.state = PendingState::Sending;
        tracked.attempts += 1;
        Ok(tracked.message.clone())
    }

    /// Retires a pending message whose server copy has been observed.
    pub fn confirm(&mut self, temp_id: &TempId) -> Option<PendingMessage> {
        self.remove(temp_id)
    }

    /// Discards a pending message.
    pub fn remove(&mut self, temp_id: &TempId) -> Option<PendingMessage> {
        let index = self
            .entries
            .iter()
            .position(|t| t.message.temp_id == *temp_id)?;
        Some(self.entries.remove(index).message)
    }

    /// Returns the first pending message (by insertion order) that
    /// `incoming` confirms.
    #[must_use]
    pub fn find_match(&self, incoming: &Message) -> Option<TempId> {
        self.entries
            .iter()
            .find(|t| {
                t.message.conversation_id == incoming.conversation_id
                    && self.matcher.matches(&t.message, incoming)
            })
            .map(|t| t.message.temp_id)
    }

    /// Iterates pending messages in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.entries.iter().map(|t| &t.message)
    }

    /// Iterates pending messages mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingMessage> {
        self.entries.iter_mut().map(|t| &mut t.message)
    }

    /// Number of tracked messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets everything (conversation switch).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
