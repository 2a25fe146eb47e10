//! Per-conversation change feed subscription.
//!
//! A [`LiveSubscriber`] keeps at most one feed open. Each feed runs as a
//! background task that reconnects with exponential backoff when the
//! stream drops, and delivers events in two phases: the message right
//! away with whatever the profile cache already knows, then an
//! [`Enrichment`] once the author name and reply preview resolve.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use coursechat_proto::codec;
use coursechat_proto::message::{ConversationId, Enrichment, Message, MessageId};
use coursechat_proto::wire::{MessageRow, PushFrame};

use crate::enrich::Enricher;
use crate::error::ChatError;
use crate::transport::{Backend, authorized};

/// Default first reconnect delay.
pub const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_millis(250);
/// Default reconnect delay ceiling.
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Observable feed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    /// A feed is currently open.
    pub connected: bool,
    /// The feed dropped and is being re-established.
    pub reconnecting: bool,
}

impl ConnectionState {
    /// The error a dropped feed surfaces as, while it is being re-established.
    #[must_use]
    pub const fn error(self) -> Option<ChatError> {
        if self.reconnecting {
            Some(ChatError::SubscriptionDropped)
        } else {
            None
        }
    }
}

/// Receiver of normalized change-feed events.
pub trait LiveEventSink: Send + Sync + 'static {
    /// A new message, named from the cache.
    fn on_insert(&self, message: Message) -> impl Future<Output = ()> + Send;

    /// A newer copy of a known message.
    fn on_update(&self, message: Message) -> impl Future<Output = ()> + Send;

    /// A message was removed.
    fn on_delete(&self, id: MessageId) -> impl Future<Output = ()> + Send;

    /// Names or previews resolved after delivery.
    fn on_enrichment(&self, patch: Enrichment) -> impl Future<Output = ()> + Send;
}

/// Exponential reconnect delay.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `initial`, doubling up to `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Starts over after a successful connect.
    pub const fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_INITIAL, DEFAULT_RECONNECT_MAX)
    }
}

/// Closes a subscription. Dropping the handle also closes it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    conversation: ConversationId,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    /// Conversation this feed is filtered to.
    #[must_use]
    pub const fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Stops the feed. Safe to call more than once.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(conversation = %self.conversation, "closing live subscription");
            self.cancel.cancel();
        }
    }

    /// Returns `true` once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens and supervises change feeds.
pub struct LiveSubscriber<B> {
    backend: Arc<B>,
    enricher: Enricher<B>,
    backoff: Backoff,
    connection: Arc<watch::Sender<ConnectionState>>,
    active: Mutex<Option<CancellationToken>>,
}

impl<B> std::fmt::Debug for LiveSubscriber<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSubscriber")
            .field("backoff", &self.backoff)
            .field("connection", &*self.connection.borrow())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> LiveSubscriber<B> {
    /// Creates a subscriber with no open feed.
    pub fn new(backend: Arc<B>, enricher: Enricher<B>, backoff: Backoff) -> Self {
        let (connection, _) = watch::channel(ConnectionState::default());
        Self {
            backend,
            enricher,
            backoff,
            connection: Arc::new(connection),
            active: Mutex::new(None),
        }
    }

    /// Watches connection state of the current feed.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Opens a feed for `conversation`, closing any previous feed first.
    pub fn subscribe<S: LiveEventSink>(
        &self,
        conversation: ConversationId,
        sink: S,
    ) -> SubscriptionHandle {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.active.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        self.connection.send_replace(ConnectionState::default());

        let task = FeedTask {
            backend: Arc::clone(&self.backend),
            enricher: self.enricher.clone(),
            connection: Arc::clone(&self.connection),
            conversation: conversation.clone(),
            sink: Arc::new(sink),
            cancel: cancel.clone(),
            backoff: self.backoff,
        };
        tracing::info!(conversation = %conversation, "opening live subscription");
        tokio::spawn(task.run());

        SubscriptionHandle {
            conversation,
            cancel,
        }
    }

    /// Closes the current feed, if any.
    pub fn close_active(&self) {
        if let Some(active) = self.active.lock().take() {
            active.cancel();
        }
        self.connection.send_replace(ConnectionState::default());
    }
}

struct FeedTask<B, S> {
    backend: Arc<B>,
    enricher: Enricher<B>,
    connection: Arc<watch::Sender<ConnectionState>>,
    conversation: ConversationId,
    sink: Arc<S>,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl<B: Backend, S: LiveEventSink> FeedTask<B, S> {
    async fn run(mut self) {
        loop {
            let backend = &*self.backend;
            let conversation = &self.conversation;
            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = authorized(backend, move |token| backend.subscribe(token, conversation)) => result,
            };

            match opened {
                Ok(mut stream) => {
                    self.set_state(true, false);
                    self.backoff.reset();
                    tracing::debug!(conversation = %self.conversation, "live feed connected");
                    loop {
                        let frame = tokio::select! {
                            biased;
                            () = self.cancel.cancelled() => break,
                            frame = stream.next() => frame,
                        };
                        match frame {
                            Some(Ok(bytes)) => self.handle_frame(&bytes).await,
                            Some(Err(e)) => {
                                tracing::warn!(conversation = %self.conversation, error = %e, "live feed error");
                                break;
                            }
                            None => {
                                tracing::warn!(conversation = %self.conversation, "live feed dropped");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(conversation = %self.conversation, error = %e, "live subscribe failed");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(false, true);
            let delay = self.backoff.next_delay();
            tracing::debug!(
                conversation = %self.conversation,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting live feed"
            );
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(conversation = %self.conversation, "live feed task finished");
    }

    fn set_state(&self, connected: bool, reconnecting: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.connection.send_replace(ConnectionState {
            connected,
            reconnecting,
        });
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        let frame = match codec::decode_push(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(conversation = %self.conversation, error = %e, "malformed push frame skipped");
                return;
            }
        };
        if let Some(conversation) = frame.conversation_id()
            && *conversation != self.conversation
        {
            tracing::debug!(
                expected = %self.conversation,
                got = %conversation,
                "push frame for other conversation dropped"
            );
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        match frame {
            PushFrame::Insert { record } => {
                let message = self.normalize(record);
                let enrich = self.needs_enrichment(&message);
                self.sink.on_insert(message.clone()).await;
                if enrich {
                    self.spawn_enrichment(message);
                }
            }
            PushFrame::Update { record } => {
                let message = self.normalize(record);
                let enrich = self.needs_enrichment(&message);
                self.sink.on_update(message.clone()).await;
                if enrich {
                    self.spawn_enrichment(message);
                }
            }
            PushFrame::Delete { old_record } => {
                self.sink.on_delete(old_record.id).await;
            }
        }
    }

    fn normalize(&self, record: MessageRow) -> Message {
        let name = self.enricher.profiles().get_cached(record.user_id);
        let mut message = record.into_message(name);
        if let Some(reply_to) = &message.reply_to_id {
            message.reply_preview = self.enricher.cached_preview(reply_to);
        }
        message
    }

    fn needs_enrichment(&self, message: &Message) -> bool {
        !message.author_name.is_known() || message.needs_reply_preview()
    }

    fn spawn_enrichment(&self, message: Message) {
        let enricher = self.enricher.clone();
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let patch = enricher.enrich(&message).await;
            if cancel.is_cancelled() {
                tracing::debug!(message_id = %message.id, "stale enrichment dropped");
                return;
            }
            if !patch.is_empty() {
                sink.on_enrichment(patch).await;
            }
        });
    }
}
