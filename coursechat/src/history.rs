//! Cursor-paginated history fetching.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use coursechat_proto::codec;
use coursechat_proto::message::{ConversationId, Message, Timestamp, UserId};
use coursechat_proto::wire::Profile;

use crate::error::ChatError;
use crate::profile::ProfileCache;
use crate::transport::{Backend, PageRequest, authorized};

/// Default number of rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// A decoded page in chronological order.
#[derive(Debug)]
pub struct HistoryPage {
    /// Messages, oldest first, named from the profile cache.
    pub messages: Vec<Message>,
    /// Whether older rows exist.
    pub has_more: bool,
    /// Background lookup for authors the cache did not know yet.
    pub prefetch: Option<JoinHandle<Vec<Profile>>>,
}

/// Result of a fetch that was not an error.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The page arrived.
    Page(HistoryPage),
    /// The token fired first. The caller must not touch state.
    Cancelled,
}

/// Issues history requests for one session.
pub struct HistoryFetcher<B> {
    backend: Arc<B>,
    profiles: Arc<ProfileCache<B>>,
    page_size: usize,
}

impl<B> std::fmt::Debug for HistoryFetcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryFetcher")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> HistoryFetcher<B> {
    /// Creates a fetcher requesting `page_size` rows per page.
    pub const fn new(backend: Arc<B>, profiles: Arc<ProfileCache<B>>, page_size: usize) -> Self {
        Self {
            backend,
            profiles,
            page_size,
        }
    }

    /// Fetches the page older than `before` (or the newest page).
    ///
    /// Rows arrive newest-first and are returned oldest-first. A profile
    /// prefetch for unknown authors is started before returning.
    ///
    /// # Errors
    ///
    /// [`ChatError::AuthExpired`] after a failed refresh-and-retry,
    /// [`ChatError::Transport`] for other backend failures, and
    /// [`ChatError::Malformed`] if the body does not decode.
    pub async fn fetch_page(
        &self,
        conversation: &ConversationId,
        before: Option<Timestamp>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, ChatError> {
        let request = PageRequest {
            conversation_id: conversation.clone(),
            before,
            limit: self.page_size,
        };
        let backend = &*self.backend;
        let request_ref = &request;

        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
            result = authorized(backend, move |token| backend.fetch_page(token, request_ref)) => result?,
        };
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }

        let page = codec::decode_page(&body)?;
        let has_more = page
            .has_more
            .unwrap_or(page.messages.len() >= self.page_size);

        let mut unknown: Vec<UserId> = Vec::new();
        let mut messages: Vec<Message> = page
            .messages
            .into_iter()
            .map(|row| {
                let name = self.profiles.get_cached(row.user_id);
                if !name.is_known() && !unknown.contains(&row.user_id) {
                    unknown.push(row.user_id);
                }
                row.into_message(name)
            })
            .collect();
        messages.reverse();

        tracing::debug!(
            conversation = %conversation,
            before = ?before.map(|t| t.as_millis()),
            rows = messages.len(),
            has_more,
            unknown_authors = unknown.len(),
            "history page fetched"
        );

        let prefetch = (!unknown.is_empty()).then(|| self.profiles.spawn_prefetch(unknown));
        Ok(FetchOutcome::Page(HistoryPage {
            messages,
            has_more,
            prefetch,
        }))
    }
}
