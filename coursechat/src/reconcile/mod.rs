//! The merge engine that owns a conversation's visible message list.
//!
//! [`Reconciler`] is plain synchronous state. History pages, live events
//! and optimistic transitions are all applied through its methods, one at a
//! time, by the session worker. Every mutation keeps three properties:
//!
//! - each server id appears at most once;
//! - rows are sorted by `(created_at, id)` ascending;
//! - a pending row never coexists with its confirmed twin.
//!
//! Pending rows are owned by the embedded [`OptimisticTracker`]; the list
//! only records where they sit.

pub mod view;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use coursechat_proto::message::{
    ConversationId, DisplayName, Enrichment, Message, MessageId, PendingMessage, TempId,
    Timestamp, UserId,
};
use coursechat_proto::wire::Profile;

use crate::error::ChatError;
use crate::optimistic::{OptimisticTracker, PendingMatcher};

pub use view::{ConversationView, LoadPhase, ViewEntry};

/// A history request the caller should issue next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRequest {
    /// The most recent page.
    Initial,
    /// The page strictly older than `before`.
    Older {
        /// Oldest confirmed `created_at` currently visible.
        before: Timestamp,
    },
}

impl LoadRequest {
    /// Cursor to send with the request.
    #[must_use]
    pub const fn before(self) -> Option<Timestamp> {
        match self {
            Self::Initial => None,
            Self::Older { before } => Some(before),
        }
    }

    /// Returns `true` for an older-page request.
    #[must_use]
    pub const fn is_prepend(self) -> bool {
        matches!(self, Self::Older { .. })
    }
}

#[derive(Debug)]
enum Slot {
    Confirmed(Message),
    Pending(TempId),
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey<'a> {
    at: Timestamp,
    id: Cow<'a, str>,
}

/// Authoritative state for the active conversation.
#[derive(Debug)]
pub struct Reconciler {
    conversation: Option<ConversationId>,
    epoch: u64,
    phase: LoadPhase,
    loading: Option<LoadRequest>,
    history_applied: bool,
    has_more_history: bool,
    last_error: Option<ChatError>,
    slots: Vec<Slot>,
    tracker: OptimisticTracker,
}

impl Reconciler {
    /// Creates an empty reconciler using `matcher` for push/pending pairing.
    #[must_use]
    pub fn new(matcher: Arc<dyn PendingMatcher>) -> Self {
        Self {
            conversation: None,
            epoch: 0,
            phase: LoadPhase::Empty,
            loading: None,
            history_applied: false,
            has_more_history: false,
            last_error: None,
            slots: Vec::new(),
            tracker: OptimisticTracker::new(matcher),
        }
    }

    /// Active conversation.
    #[must_use]
    pub const fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    /// Epoch of the active conversation.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current load phase.
    #[must_use]
    pub const fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Pending messages, in insertion order.
    #[must_use]
    pub const fn tracker(&self) -> &OptimisticTracker {
        &self.tracker
    }

    /// Number of visible rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if nothing is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Finds a visible confirmed message.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.position_of(id).and_then(|index| match &self.slots[index] {
            Slot::Confirmed(m) => Some(m),
            Slot::Pending(_) => None,
        })
    }

    /// Clears everything and starts loading `conversation`.
    ///
    /// The caller issues [`LoadRequest::Initial`] next.
    pub fn set_active_conversation(&mut self, conversation: ConversationId, epoch: u64) {
        tracing::debug!(
            conversation = %conversation,
            epoch,
            dropped = self.slots.len(),
            "switching conversation"
        );
        self.slots.clear();
        self.tracker.clear();
        self.conversation = Some(conversation);
        self.epoch = epoch;
        self.phase = LoadPhase::Loading;
        self.loading = Some(LoadRequest::Initial);
        self.history_applied = false;
        self.has_more_history = true;
        self.last_error = None;
    }

    /// Decides the next history request for `load_more`.
    ///
    /// Returns `None` (no-op) while a page is in flight, when no older
    /// history exists, or with no active conversation. Re-issues the
    /// initial request when no page has been applied yet.
    pub fn begin_load_more(&mut self) -> Option<LoadRequest> {
        self.conversation.as_ref()?;
        if self.loading.is_some() {
            return None;
        }
        let request = if self.history_applied {
            if !self.has_more_history {
                return None;
            }
            self.oldest_confirmed()
                .map_or(LoadRequest::Initial, |before| LoadRequest::Older { before })
        } else {
            LoadRequest::Initial
        };
        self.loading = Some(request);
        self.phase = LoadPhase::Loading;
        tracing::debug!(epoch = self.epoch, ?request, "history load started");
        Some(request)
    }

    /// Applies one chronologically ordered history page.
    ///
    /// Older pages never touch rows already visible. The initial page
    /// enriches rows that arrived live while it was in flight and keeps
    /// them, along with pending rows.
    pub fn apply_history_page(&mut self, messages: Vec<Message>, has_more: bool, is_prepend: bool) {
        let received = messages.len();
        let mut added = 0usize;
        for message in messages {
            if !self.belongs(&message) {
                continue;
            }
            match self.position_of(&message.id) {
                Some(index) if !is_prepend => self.enrich_at(index, message),
                Some(_) => {}
                None => {
                    self.insert_confirmed(message);
                    added += 1;
                }
            }
        }
        self.has_more_history = has_more;
        self.loading = None;
        self.history_applied = true;
        self.phase = LoadPhase::Ready;
        self.last_error = None;
        tracing::debug!(
            epoch = self.epoch,
            received,
            added,
            has_more,
            is_prepend,
            "history page applied"
        );
    }

    /// Records a failed history request. Visible rows are untouched.
    pub fn history_failed(&mut self, error: ChatError) {
        tracing::warn!(epoch = self.epoch, error = %error, "history load failed");
        self.loading = None;
        self.phase = if self.history_applied {
            LoadPhase::Ready
        } else {
            LoadPhase::Empty
        };
        self.last_error = Some(error);
    }

    /// Applies a pushed insert.
    ///
    /// A known id is merged as enrichment. Otherwise the first matching
    /// pending row is replaced in place, or the message is inserted in
    /// sorted position.
    pub fn apply_live_insert(&mut self, message: Message) {
        if !self.belongs(&message) {
            return;
        }
        match self.position_of(&message.id) {
            Some(index) => self.enrich_at(index, message),
            None => self.insert_confirmed(message),
        }
    }

    /// Applies a pushed update in place. Unknown ids are ignored.
    pub fn apply_live_update(&mut self, message: Message) {
        if !self.belongs(&message) {
            return;
        }
        match self.position_of(&message.id) {
            Some(index) => {
                if let Slot::Confirmed(existing) = &mut self.slots[index] {
                    existing.merge_from(message);
                }
            }
            None => {
                tracing::debug!(
                    epoch = self.epoch,
                    message_id = %message.id,
                    "update for unknown message ignored"
                );
            }
        }
    }

    /// Applies an enrichment patch in place.
    ///
    /// Returns `false` if the message is not visible.
    pub fn apply_enrichment(&mut self, patch: &Enrichment) -> bool {
        let Some(index) = self.position_of(&patch.message_id) else {
            tracing::debug!(message_id = %patch.message_id, "enrichment target not visible");
            return false;
        };
        if let Slot::Confirmed(existing) = &mut self.slots[index] {
            existing.apply_enrichment(patch);
        }
        true
    }

    /// Upgrades author names (and reply-preview author names) on every
    /// visible row from the given profiles. Returns how many rows changed.
    pub fn apply_profiles(&mut self, profiles: &[Profile]) -> usize {
        if profiles.is_empty() {
            return 0;
        }
        let names: HashMap<UserId, &str> = profiles
            .iter()
            .map(|p| (p.user_id, p.display_name.as_str()))
            .collect();
        let rename = |author: UserId, name: &mut DisplayName| -> bool {
            match names.get(&author) {
                Some(known) if name.as_str() != *known || !name.is_known() => {
                    *name = DisplayName::Known((*known).to_string());
                    true
                }
                _ => false,
            }
        };

        let mut changed = 0;
        for slot in &mut self.slots {
            if let Slot::Confirmed(message) = slot {
                let mut touched = rename(message.author_id, &mut message.author_name);
                if let Some(preview) = &mut message.reply_preview {
                    touched |= rename(preview.author_id, &mut preview.author_name);
                }
                changed += usize::from(touched);
            }
        }
        for pending in self.tracker.iter_mut() {
            let mut touched = rename(pending.author_id, &mut pending.author_name);
            if let Some(preview) = &mut pending.reply_preview {
                touched |= rename(preview.author_id, &mut preview.author_name);
            }
            changed += usize::from(touched);
        }
        changed
    }

    /// Removes a message. Returns `false` if it was not visible.
    pub fn apply_live_delete(&mut self, id: &MessageId) -> bool {
        match self.position_of(id) {
            Some(index) => {
                self.slots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Flips `user`'s `emoji` reaction on a visible message.
    ///
    /// Returns whether the user now reacts, or `None` if the message is
    /// not visible.
    pub fn apply_reaction_toggle(
        &mut self,
        id: &MessageId,
        emoji: &str,
        user: UserId,
    ) -> Option<bool> {
        let index = self.position_of(id)?;
        match &mut self.slots[index] {
            Slot::Confirmed(message) => Some(message.toggle_reaction(emoji, user)),
            Slot::Pending(_) => None,
        }
    }

    /// Shows a freshly created pending message.
    pub fn add_pending(&mut self, pending: PendingMessage) {
        if self.conversation.as_ref() != Some(&pending.conversation_id) {
            tracing::warn!(
                temp_id = %pending.temp_id,
                conversation = %pending.conversation_id,
                "pending message for inactive conversation dropped"
            );
            return;
        }
        let temp_id = self.tracker.create(pending);
        if self.pending_position(&temp_id).is_none() {
            self.insert_sorted(Slot::Pending(temp_id));
        }
        tracing::debug!(epoch = self.epoch, temp_id = %temp_id, "pending message shown");
    }

    /// Applies the direct server response to a send.
    ///
    /// If the confirmed id is already visible (it arrived by push first),
    /// the pending row is discarded. Otherwise the pending row is replaced
    /// in place. If the pending row was dismissed meanwhile, the confirmed
    /// message is inserted anyway since it exists on the server.
    pub fn confirm_pending(&mut self, temp_id: TempId, message: Message) {
        if !self.belongs(&message) {
            if let Some(index) = self.pending_position(&temp_id) {
                self.slots.remove(index);
            }
            self.tracker.remove(&temp_id);
            return;
        }
        if let Some(index) = self.position_of(&message.id) {
            if let Some(pending_index) = self.pending_position(&temp_id) {
                self.slots.remove(pending_index);
            }
            self.tracker.confirm(&temp_id);
            let index = self.position_of(&message.id).unwrap_or(index);
            self.enrich_at(index, message);
            tracing::debug!(temp_id = %temp_id, "pending discarded, confirmed copy already visible");
            return;
        }
        if self.pending_position(&temp_id).is_some() {
            self.replace_pending(temp_id, message);
        } else {
            self.tracker.remove(&temp_id);
            self.insert_sorted(Slot::Confirmed(message));
        }
    }

    /// Marks a pending message failed. Returns `false` if it is no longer
    /// pending (already confirmed or dismissed).
    pub fn fail_pending(&mut self, temp_id: &TempId, error: &ChatError) -> bool {
        let failed = self.tracker.mark_failed(temp_id, error.to_string());
        if failed {
            tracing::debug!(temp_id = %temp_id, error = %error, "pending message failed");
        }
        failed
    }

    /// Starts a retry attempt for a failed pending message.
    ///
    /// # Errors
    ///
    /// [`ChatError::RetryInFlight`] while an attempt is running,
    /// [`ChatError::UnknownPending`] if the id is not visible.
    pub fn begin_retry(&mut self, temp_id: &TempId) -> Result<PendingMessage, ChatError> {
        self.tracker.begin_retry(temp_id)
    }

    /// Removes a pending message. Returns `false` if it was not visible.
    pub fn dismiss(&mut self, temp_id: &TempId) -> bool {
        let Some(index) = self.pending_position(temp_id) else {
            return false;
        };
        self.slots.remove(index);
        self.tracker.remove(temp_id);
        true
    }

    /// Builds the read model.
    #[must_use]
    pub fn view(&self) -> ConversationView {
        let entries = self
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Confirmed(m) => Some(ViewEntry::Confirmed(m.clone())),
                Slot::Pending(temp_id) => self.tracker.get(temp_id).cloned().map(ViewEntry::Pending),
            })
            .collect();
        ConversationView {
            conversation_id: self.conversation.clone(),
            entries,
            has_more_history: self.has_more_history,
            is_loading_history: self.loading.is_some(),
            phase: self.phase,
            last_error: self.last_error.clone(),
        }
    }

    // --- internals ---

    fn belongs(&self, message: &Message) -> bool {
        let ok = self.conversation.as_ref() == Some(&message.conversation_id);
        if !ok {
            tracing::debug!(
                message_id = %message.id,
                conversation = %message.conversation_id,
                "message for inactive conversation dropped"
            );
        }
        ok
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Confirmed(m) if m.id == *id))
    }

    fn pending_position(&self, temp_id: &TempId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Pending(t) if t == temp_id))
    }

    fn oldest_confirmed(&self) -> Option<Timestamp> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Confirmed(m) => Some(m.created_at),
                Slot::Pending(_) => None,
            })
            .min()
    }

    fn key<'a>(&'a self, slot: &'a Slot) -> SortKey<'a> {
        match slot {
            Slot::Confirmed(m) => SortKey {
                at: m.created_at,
                id: Cow::Borrowed(m.id.as_str()),
            },
            Slot::Pending(temp_id) => SortKey {
                at: self
                    .tracker
                    .get(temp_id)
                    .map(|p| p.created_at)
                    .unwrap_or_default(),
                id: Cow::Owned(temp_id.to_string()),
            },
        }
    }

    /// Merges names and previews from `incoming` without touching content.
    fn enrich_at(&mut self, index: usize, incoming: Message) {
        if let Slot::Confirmed(existing) = &mut self.slots[index] {
            existing.apply_enrichment(&Enrichment {
                message_id: incoming.id,
                author_name: Some(incoming.author_name),
                reply_preview: incoming.reply_preview,
            });
        }
    }

    fn insert_confirmed(&mut self, message: Message) {
        if let Some(temp_id) = self.tracker.find_match(&message) {
            self.replace_pending(temp_id, message);
        } else {
            self.insert_sorted(Slot::Confirmed(message));
        }
    }

    /// Swaps a pending row for its confirmed copy at the same position,
    /// moving it only if the server timestamp breaks the order.
    fn replace_pending(&mut self, temp_id: TempId, mut message: Message) {
        let Some(index) = self.pending_position(&temp_id) else {
            self.insert_sorted(Slot::Confirmed(message));
            return;
        };
        if let Some(pending) = self.tracker.confirm(&temp_id) {
            message.author_name.merge_from(pending.author_name);
            if message.reply_preview.is_none() && message.reply_to_id == pending.reply_to_id {
                message.reply_preview = pending.reply_preview;
            }
        }
        tracing::debug!(
            epoch = self.epoch,
            temp_id = %temp_id,
            message_id = %message.id,
            "pending message confirmed"
        );
        self.slots[index] = Slot::Confirmed(message);
        self.reposition(index);
    }

    fn reposition(&mut self, index: usize) {
        let in_order = {
            let key = self.key(&self.slots[index]);
            let after_prev = index == 0 || self.key(&self.slots[index - 1]) <= key;
            let before_next =
                index + 1 >= self.slots.len() || key <= self.key(&self.slots[index + 1]);
            after_prev && before_next
        };
        if !in_order {
            let slot = self.slots.remove(index);
            self.insert_sorted(slot);
        }
    }

    fn insert_sorted(&mut self, slot: Slot) {
        let index = {
            let key = self.key(&slot);
            self.slots.partition_point(|other| self.key(other) <= key)
        };
        self.slots.insert(index, slot);
    }
}
