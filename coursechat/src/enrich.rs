//! Author-name and reply-preview enrichment shared by the history and
//! live paths.
//!
//! Replied-to messages are looked up in the published view first and only
//! fetched from the backend when they are not visible.

use std::sync::Arc;

use tokio::sync::watch;

use coursechat_proto::codec;
use coursechat_proto::message::{DisplayName, Enrichment, Message, MessageId, ReplyPreview};

use crate::profile::ProfileCache;
use crate::reconcile::ConversationView;
use crate::transport::{Backend, authorized};

/// Resolves the slow parts of a message after it has been displayed.
pub struct Enricher<B> {
    backend: Arc<B>,
    profiles: Arc<ProfileCache<B>>,
    view: watch::Receiver<ConversationView>,
    excerpt_chars: usize,
}

impl<B> Clone for Enricher<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            profiles: Arc::clone(&self.profiles),
            view: self.view.clone(),
            excerpt_chars: self.excerpt_chars,
        }
    }
}

impl<B> std::fmt::Debug for Enricher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("excerpt_chars", &self.excerpt_chars)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Enricher<B> {
    /// Creates an enricher reading visible messages from `view`.
    pub const fn new(
        backend: Arc<B>,
        profiles: Arc<ProfileCache<B>>,
        view: watch::Receiver<ConversationView>,
        excerpt_chars: usize,
    ) -> Self {
        Self {
            backend,
            profiles,
            view,
            excerpt_chars,
        }
    }

    /// The shared profile cache.
    pub const fn profiles(&self) -> &Arc<ProfileCache<B>> {
        &self.profiles
    }

    /// Builds a preview from the visible list using cached names only.
    pub fn cached_preview(&self, reply_to: &MessageId) -> Option<ReplyPreview> {
        let view = self.view.borrow();
        let target = view.message(reply_to)?;
        let mut name = target.author_name.clone();
        name.merge_from(self.profiles.get_cached(target.author_id));
        Some(ReplyPreview::new(
            target.author_id,
            name,
            &target.content,
            self.excerpt_chars,
        ))
    }

    /// Resolves a reply preview, fetching the target if it is not visible.
    ///
    /// Returns `None` if the target cannot be loaded.
    pub async fn reply_preview(&self, reply_to: &MessageId) -> Option<ReplyPreview> {
        if let Some(mut preview) = self.cached_preview(reply_to) {
            if !preview.author_name.is_known() {
                preview.author_name = self.profiles.resolve_now(preview.author_id).await;
            }
            return Some(preview);
        }

        let backend = &*self.backend;
        let body = match authorized(backend, move |token| backend.fetch_message(token, reply_to)).await
        {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(message_id = %reply_to, error = %e, "reply target unavailable");
                return None;
            }
        };
        let row = match codec::decode_row(&body) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(message_id = %reply_to, error = %e, "malformed reply target");
                return None;
            }
        };
        let name = self.profiles.resolve_now(row.user_id).await;
        Some(ReplyPreview::new(
            row.user_id,
            name,
            &row.content,
            self.excerpt_chars,
        ))
    }

    /// Resolves whatever `message` is still missing.
    ///
    /// The patch only carries fields that resolved to something richer
    /// than what `message` already has.
    pub async fn enrich(&self, message: &Message) -> Enrichment {
        let author_name = if message.author_name.is_known() {
            None
        } else {
            Some(self.profiles.resolve_now(message.author_id).await).filter(DisplayName::is_known)
        };
        let reply_preview = match &message.reply_to_id {
            Some(reply_to) if message.needs_reply_preview() => self.reply_preview(reply_to).await,
            _ => None,
        };
        Enrichment {
            message_id: message.id.clone(),
            author_name,
            reply_preview,
        }
    }
}
