//! The single-consumer worker and the handle the UI talks to.
//!
//! One worker task owns the [`Reconciler`]. History fetches, the live
//! feed, send attempts and UI calls all reach it as commands over one
//! bounded channel, each tagged with the epoch that was active when its
//! work started. Switching conversation bumps the epoch and cancels the
//! previous epoch's fetches and feed before anything for the new
//! conversation is started; the worker drops whatever stale work still
//! arrives. After every applied command the worker publishes a fresh
//! [`ConversationView`] on a watch channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use coursechat_proto::codec;
use coursechat_proto::message::{
    ConversationId, Enrichment, Message, MessageId, PendingMessage, REPLY_EXCERPT_CHARS, TempId,
    UserId,
};
use coursechat_proto::wire::{OutgoingMessage, Profile};

use crate::enrich::Enricher;
use crate::error::ChatError;
use crate::history::{DEFAULT_PAGE_SIZE, FetchOutcome, HistoryFetcher, HistoryPage};
use crate::live::{
    Backoff, ConnectionState, DEFAULT_RECONNECT_INITIAL, DEFAULT_RECONNECT_MAX, LiveEventSink,
    LiveSubscriber, SubscriptionHandle,
};
use crate::optimistic::{self, ContentWindowMatcher, DEFAULT_MATCH_WINDOW, PendingMatcher};
use crate::profile::ProfileCache;
use crate::reconcile::{ConversationView, LoadRequest, Reconciler};
use crate::transport::{Backend, authorized};

/// Default capacity of the worker's command channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Engine settings for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// The signed-in user.
    pub user_id: UserId,
    /// Worker command channel capacity.
    pub channel_capacity: usize,
    /// History rows per page.
    pub page_size: usize,
    /// First live reconnect delay.
    pub reconnect_initial: Duration,
    /// Live reconnect delay ceiling.
    pub reconnect_max: Duration,
    /// Window for pairing pushed messages with pending ones.
    pub match_window: Duration,
    /// Reply preview excerpt length in characters.
    pub reply_excerpt_chars: usize,
}

impl SessionConfig {
    /// Defaults for `user_id`.
    #[must_use]
    pub const fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            reconnect_initial: DEFAULT_RECONNECT_INITIAL,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            match_window: DEFAULT_MATCH_WINDOW,
            reply_excerpt_chars: REPLY_EXCERPT_CHARS,
        }
    }
}

/// Work items for the reconciler worker.
#[derive(Debug)]
pub(crate) enum Command {
    /// Clear state and start loading a conversation.
    SetActive {
        /// Conversation to show.
        conversation: ConversationId,
        /// Epoch assigned to it.
        epoch: u64,
    },
    /// A history page arrived.
    HistoryPage {
        /// Epoch of the fetch.
        epoch: u64,
        /// Messages, oldest first.
        messages: Vec<Message>,
        /// Whether older rows exist.
        has_more: bool,
        /// Older page rather than the initial one.
        is_prepend: bool,
    },
    /// A history fetch failed.
    HistoryFailed {
        /// Epoch of the fetch.
        epoch: u64,
        /// What went wrong.
        error: ChatError,
    },
    /// Pushed insert.
    LiveInsert {
        /// Epoch of the feed.
        epoch: u64,
        /// The message.
        message: Message,
    },
    /// Pushed update.
    LiveUpdate {
        /// Epoch of the feed.
        epoch: u64,
        /// The message.
        message: Message,
    },
    /// Pushed delete.
    LiveDelete {
        /// Epoch of the feed.
        epoch: u64,
        /// Removed message.
        id: MessageId,
    },
    /// Resolved name or preview for one message.
    Enrich {
        /// Epoch of the work that resolved it.
        epoch: u64,
        /// The patch.
        patch: Enrichment,
    },
    /// Resolved profiles to apply to every row by those authors.
    Profiles {
        /// Epoch of the work that resolved them.
        epoch: u64,
        /// The profiles.
        profiles: Vec<Profile>,
    },
    /// Show a new pending message.
    AddPending {
        /// Epoch of the send.
        epoch: u64,
        /// The pending message.
        pending: PendingMessage,
    },
    /// The server answered a send.
    Confirm {
        /// Epoch of the send.
        epoch: u64,
        /// Pending message being confirmed.
        temp_id: TempId,
        /// Stored copy.
        message: Message,
    },
    /// A send attempt failed.
    Fail {
        /// Epoch of the send.
        epoch: u64,
        /// Pending message that failed.
        temp_id: TempId,
        /// Why.
        error: ChatError,
    },
    /// Start a retry attempt.
    BeginRetry {
        /// Pending message to retry.
        temp_id: TempId,
        /// The message to resend, or why not.
        reply: oneshot::Sender<Result<(u64, PendingMessage), ChatError>>,
    },
    /// Remove a pending message.
    Dismiss {
        /// Pending message to remove.
        temp_id: TempId,
        /// Whether it was visible.
        reply: oneshot::Sender<bool>,
    },
    /// Decide the next history request.
    BeginLoadMore {
        /// Request to issue, if any.
        reply: oneshot::Sender<Option<(u64, ConversationId, LoadRequest)>>,
    },
    /// Flip a reaction locally.
    ToggleReaction {
        /// Epoch of the toggle.
        epoch: u64,
        /// Target message.
        id: MessageId,
        /// The emoji.
        emoji: String,
        /// Reacting user.
        user: UserId,
        /// Whether the user now reacts, `None` if the message is not visible.
        reply: Option<oneshot::Sender<Option<bool>>>,
    },
    /// Stop the worker.
    Shutdown,
}

impl Command {
    /// Epoch the command was produced under, for stale-work filtering.
    const fn epoch(&self) -> Option<u64> {
        match self {
            Self::HistoryPage { epoch, .. }
            | Self::HistoryFailed { epoch, .. }
            | Self::LiveInsert { epoch, .. }
            | Self::LiveUpdate { epoch, .. }
            | Self::LiveDelete { epoch, .. }
            | Self::Enrich { epoch, .. }
            | Self::Profiles { epoch, .. }
            | Self::AddPending { epoch, .. }
            | Self::Confirm { epoch, .. }
            | Self::Fail { epoch, .. }
            | Self::ToggleReaction { epoch, .. } => Some(*epoch),
            Self::SetActive { .. }
            | Self::BeginRetry { .. }
            | Self::Dismiss { .. }
            | Self::BeginLoadMore { .. }
            | Self::Shutdown => None,
        }
    }
}

struct Worker {
    reconciler: Reconciler,
    commands: mpsc::Receiver<Command>,
    view: watch::Sender<ConversationView>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            if let Some(epoch) = command.epoch()
                && epoch != self.reconciler.epoch()
            {
                tracing::debug!(
                    epoch,
                    active_epoch = self.reconciler.epoch(),
                    "stale update dropped"
                );
                continue;
            }
            if self.apply(command) {
                self.view.send_replace(self.reconciler.view());
            }
        }
        tracing::info!("session worker stopped");
    }

    /// Applies one command. Returns `true` if the view should be republished.
    fn apply(&mut self, command: Command) -> bool {
        let r = &mut self.reconciler;
        match command {
            Command::SetActive {
                conversation,
                epoch,
            } => {
                if epoch <= r.epoch() {
                    return false;
                }
                r.set_active_conversation(conversation, epoch);
            }
            Command::HistoryPage {
                messages,
                has_more,
                is_prepend,
                ..
            } => r.apply_history_page(messages, has_more, is_prepend),
            Command::HistoryFailed { error, .. } => r.history_failed(error),
            Command::LiveInsert { message, .. } => r.apply_live_insert(message),
            Command::LiveUpdate { message, .. } => r.apply_live_update(message),
            Command::LiveDelete { id, .. } => return r.apply_live_delete(&id),
            Command::Enrich { patch, .. } => return r.apply_enrichment(&patch),
            Command::Profiles { profiles, .. } => return r.apply_profiles(&profiles) > 0,
            Command::AddPending { pending, .. } => r.add_pending(pending),
            Command::Confirm {
                temp_id, message, ..
            } => r.confirm_pending(temp_id, message),
            Command::Fail { temp_id, error, .. } => return r.fail_pending(&temp_id, &error),
            Command::BeginRetry { temp_id, reply } => {
                let result = r.begin_retry(&temp_id);
                let changed = result.is_ok();
                let epoch = r.epoch();
                let _ = reply.send(result.map(|pending| (epoch, pending)));
                return changed;
            }
            Command::Dismiss { temp_id, reply } => {
                let dismissed = r.dismiss(&temp_id);
                let _ = reply.send(dismissed);
                return dismissed;
            }
            Command::BeginLoadMore { reply } => {
                let request = r.begin_load_more();
                let issued = request.and_then(|request| {
                    r.conversation()
                        .map(|conversation| (r.epoch(), conversation.clone(), request))
                });
                let started = issued.is_some();
                let _ = reply.send(issued);
                return started;
            }
            Command::ToggleReaction {
                id,
                emoji,
                user,
                reply,
                ..
            } => {
                let result = r.apply_reaction_toggle(&id, &emoji, user);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                return result.is_some();
            }
            Command::Shutdown => return false,
        }
        true
    }
}

/// Forwards live events into the worker, tagged with the feed's epoch.
#[derive(Debug)]
struct EpochSink {
    commands: mpsc::Sender<Command>,
    epoch: u64,
    current: Arc<AtomicU64>,
}

impl EpochSink {
    async fn forward(&self, command: Command) {
        if self.current.load(Ordering::SeqCst) != self.epoch {
            return;
        }
        let _ = self.commands.send(command).await;
    }
}

impl LiveEventSink for EpochSink {
    async fn on_insert(&self, message: Message) {
        self.forward(Command::LiveInsert {
            epoch: self.epoch,
            message,
        })
        .await;
    }

    async fn on_update(&self, message: Message) {
        self.forward(Command::LiveUpdate {
            epoch: self.epoch,
            message,
        })
        .await;
    }

    async fn on_delete(&self, id: MessageId) {
        self.forward(Command::LiveDelete {
            epoch: self.epoch,
            id,
        })
        .await;
    }

    async fn on_enrichment(&self, patch: Enrichment) {
        self.forward(Command::Enrich {
            epoch: self.epoch,
            patch,
        })
        .await;
    }
}

#[derive(Debug)]
struct Active {
    conversation: ConversationId,
    epoch: u64,
    cancel: CancellationToken,
    subscription: Option<SubscriptionHandle>,
}

struct Inner<B> {
    config: SessionConfig,
    backend: Arc<B>,
    profiles: Arc<ProfileCache<B>>,
    fetcher: HistoryFetcher<B>,
    enricher: Enricher<B>,
    live: LiveSubscriber<B>,
    commands: mpsc::Sender<Command>,
    epoch: Arc<AtomicU64>,
    active: Mutex<Option<Active>>,
}

/// UI-facing handle to a chat session.
///
/// Must be started inside a Tokio runtime.
pub struct ChatSession<B> {
    inner: Arc<Inner<B>>,
    view: watch::Receiver<ConversationView>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B> std::fmt::Debug for ChatSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("user_id", &self.inner.config.user_id)
            .field("epoch", &self.inner.epoch.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> ChatSession<B> {
    /// Starts a session using the content/author/time matcher.
    pub fn start(backend: Arc<B>, config: SessionConfig) -> Self {
        let matcher = Arc::new(ContentWindowMatcher::new(config.match_window));
        Self::start_with_matcher(backend, config, matcher)
    }

    /// Starts a session with a custom pending-message matcher.
    pub fn start_with_matcher(
        backend: Arc<B>,
        config: SessionConfig,
        matcher: Arc<dyn PendingMatcher>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (view_tx, view) = watch::channel(ConversationView::default());

        let profiles = Arc::new(ProfileCache::new(Arc::clone(&backend)));
        let enricher = Enricher::new(
            Arc::clone(&backend),
            Arc::clone(&profiles),
            view.clone(),
            config.reply_excerpt_chars,
        );
        let fetcher = HistoryFetcher::new(
            Arc::clone(&backend),
            Arc::clone(&profiles),
            config.page_size,
        );
        let live = LiveSubscriber::new(
            Arc::clone(&backend),
            enricher.clone(),
            Backoff::new(config.reconnect_initial, config.reconnect_max),
        );

        let worker = Worker {
            reconciler: Reconciler::new(matcher),
            commands: commands_rx,
            view: view_tx,
        };
        let worker = tokio::spawn(worker.run());

        profiles.resolve(config.user_id);
        tracing::info!(user_id = %config.user_id, "chat session started");

        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                profiles,
                fetcher,
                enricher,
                live,
                commands,
                epoch: Arc::new(AtomicU64::new(0)),
                active: Mutex::new(None),
            }),
            view,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The signed-in user.
    pub fn local_user(&self) -> UserId {
        self.inner.config.user_id
    }

    /// The shared profile cache.
    pub fn profiles(&self) -> &Arc<ProfileCache<B>> {
        &self.inner.profiles
    }

    /// The conversation currently shown.
    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.conversation.clone())
    }

    /// Latest published view.
    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    /// Subscribes to view changes.
    pub fn watch_view(&self) -> watch::Receiver<ConversationView> {
        self.view.clone()
    }

    /// Subscribes to live feed connection changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.live.watch_connection()
    }

    /// Switches to `conversation`.
    ///
    /// Outstanding fetches and the live feed of the previous conversation
    /// are cancelled before the new conversation is loaded.
    ///
    /// # Errors
    ///
    /// [`ChatError::SessionClosed`] after [`shutdown`](Self::shutdown).
    pub async fn set_active_conversation(&self, conversation: ConversationId) -> Result<(), ChatError> {
        let (epoch, cancel) = {
            let mut active = self.inner.active.lock();
            if let Some(previous) = active.take() {
                previous.cancel.cancel();
                if let Some(subscription) = previous.subscription {
                    subscription.close();
                }
            }
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let cancel = CancellationToken::new();
            *active = Some(Active {
                conversation: conversation.clone(),
                epoch,
                cancel: cancel.clone(),
                subscription: None,
            });
            (epoch, cancel)
        };
        tracing::info!(conversation = %conversation, epoch, "active conversation changed");

        self.inner
            .send(Command::SetActive {
                conversation: conversation.clone(),
                epoch,
            })
            .await?;

        {
            let mut active = self.inner.active.lock();
            if let Some(current) = active.as_mut()
                && current.epoch == epoch
            {
                let sink = EpochSink {
                    commands: self.inner.commands.clone(),
                    epoch,
                    current: Arc::clone(&self.inner.epoch),
                };
                current.subscription = Some(self.inner.live.subscribe(conversation.clone(), sink));
            }
        }

        Inner::spawn_fetch(&self.inner, epoch, conversation, LoadRequest::Initial, cancel);
        Ok(())
    }

    /// Shows `content` immediately as pending and sends it.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] for empty or over-long content (nothing is
    /// sent), [`ChatError::NoActiveConversation`], or
    /// [`ChatError::SessionClosed`].
    pub async fn send_message(
        &self,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<TempId, ChatError> {
        let (conversation, epoch) = self.current()?;
        let user = self.inner.config.user_id;
        let reply_preview = reply_to
            .as_ref()
            .and_then(|id| self.inner.enricher.cached_preview(id));
        let pending = optimistic::draft(
            conversation,
            user,
            self.inner.profiles.get_cached(user),
            content,
            reply_to,
            reply_preview,
        )?;
        let temp_id = pending.temp_id;
        tracing::debug!(epoch, temp_id = %temp_id, "sending message");

        self.inner
            .send(Command::AddPending {
                epoch,
                pending: pending.clone(),
            })
            .await?;
        Inner::spawn_send(&self.inner, epoch, pending);
        Ok(temp_id)
    }

    /// Re-sends a failed message with the same content and temp id.
    ///
    /// # Errors
    ///
    /// [`ChatError::RetryInFlight`] while an attempt for `temp_id` is
    /// running, [`ChatError::UnknownPending`] if it is not visible.
    pub async fn retry(&self, temp_id: TempId) -> Result<(), ChatError> {
        let (epoch, pending) = self
            .request(|reply| Command::BeginRetry { temp_id, reply })
            .await??;
        tracing::debug!(epoch, temp_id = %temp_id, "retrying send");
        Inner::spawn_send(&self.inner, epoch, pending);
        Ok(())
    }

    /// Removes a pending or failed message.
    ///
    /// # Errors
    ///
    /// [`ChatError::UnknownPending`] if it is not visible.
    pub async fn dismiss(&self, temp_id: TempId) -> Result<(), ChatError> {
        if self
            .request(|reply| Command::Dismiss { temp_id, reply })
            .await?
        {
            Ok(())
        } else {
            Err(ChatError::UnknownPending(temp_id))
        }
    }

    /// Fetches the next older page.
    ///
    /// Returns `false` (no-op) while a page is in flight or when no older
    /// history exists. Re-issues the initial fetch if it failed.
    ///
    /// # Errors
    ///
    /// [`ChatError::SessionClosed`] after shutdown.
    pub async fn load_more_history(&self) -> Result<bool, ChatError> {
        let Some((epoch, conversation, request)) = self
            .request(|reply| Command::BeginLoadMore { reply })
            .await?
        else {
            return Ok(false);
        };
        let cancel = {
            let active = self.inner.active.lock();
            match active.as_ref() {
                Some(current) if current.epoch == epoch => current.cancel.clone(),
                _ => return Ok(false),
            }
        };
        Inner::spawn_fetch(&self.inner, epoch, conversation, request, cancel);
        Ok(true)
    }

    /// Toggles the local user's `emoji` reaction.
    ///
    /// The flip is shown immediately and undone if the backend rejects it.
    /// Returns whether the user now reacts.
    ///
    /// # Errors
    ///
    /// [`ChatError::UnknownMessage`] if the message is not visible, or the
    /// backend error if the call fails.
    pub async fn toggle_reaction(&self, id: &MessageId, emoji: &str) -> Result<bool, ChatError> {
        let (_, epoch) = self.current()?;
        let user = self.inner.config.user_id;
        let added = self
            .request(|reply| Command::ToggleReaction {
                epoch,
                id: id.clone(),
                emoji: emoji.to_string(),
                user,
                reply: Some(reply),
            })
            .await?
            .ok_or_else(|| ChatError::UnknownMessage(id.clone()))?;

        let backend = &*self.inner.backend;
        if let Err(e) = authorized(backend, move |token| backend.toggle_reaction(token, id, emoji)).await
        {
            tracing::warn!(message_id = %id, emoji, error = %e, "reaction toggle rejected, reverting");
            self.inner
                .send(Command::ToggleReaction {
                    epoch,
                    id: id.clone(),
                    emoji: emoji.to_string(),
                    user,
                    reply: None,
                })
                .await?;
            return Err(e.into());
        }
        Ok(added)
    }

    /// Forgets every cached profile (logout).
    pub fn clear_profiles(&self) {
        self.inner.profiles.clear();
    }

    /// Cancels all work and stops the worker.
    pub async fn shutdown(&self) {
        if let Some(active) = self.inner.active.lock().take() {
            active.cancel.cancel();
        }
        self.inner.live.close_active();
        let _ = self.inner.commands.send(Command::Shutdown).await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        tracing::info!("chat session shut down");
    }

    fn current(&self) -> Result<(ConversationId, u64), ChatError> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| (a.conversation.clone(), a.epoch))
            .ok_or(ChatError::NoActiveConversation)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(build(reply)).await?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }
}

impl<B: Backend> Inner<B> {
    async fn send(&self, command: Command) -> Result<(), ChatError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatError::SessionClosed)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn spawn_fetch(
        this: &Arc<Self>,
        epoch: u64,
        conversation: ConversationId,
        request: LoadRequest,
        cancel: CancellationToken,
    ) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.fetch_history(epoch, conversation, request, cancel).await;
        });
    }

    async fn fetch_history(
        &self,
        epoch: u64,
        conversation: ConversationId,
        request: LoadRequest,
        cancel: CancellationToken,
    ) {
        let outcome = self
            .fetcher
            .fetch_page(&conversation, request.before(), &cancel)
            .await;
        let HistoryPage {
            messages,
            has_more,
            prefetch,
        } = match outcome {
            Ok(FetchOutcome::Page(page)) => page,
            Ok(FetchOutcome::Cancelled) => {
                tracing::debug!(conversation = %conversation, epoch, "history fetch cancelled");
                return;
            }
            Err(error) => {
                if !cancel.is_cancelled() {
                    let _ = self.send(Command::HistoryFailed { epoch, error }).await;
                }
                return;
            }
        };

        let needs_preview: Vec<Message> = messages
            .iter()
            .filter(|m| m.needs_reply_preview())
            .cloned()
            .collect();
        if cancel.is_cancelled() {
            return;
        }
        let _ = self
            .send(Command::HistoryPage {
                epoch,
                messages,
                has_more,
                is_prepend: request.is_prepend(),
            })
            .await;

        if let Some(prefetch) = prefetch
            && let Ok(profiles) = prefetch.await
            && !profiles.is_empty()
            && !cancel.is_cancelled()
        {
            let _ = self.send(Command::Profiles { epoch, profiles }).await;
        }

        for message in needs_preview {
            let Some(reply_to) = &message.reply_to_id else {
                continue;
            };
            let preview = self.enricher.reply_preview(reply_to).await;
            if cancel.is_cancelled() {
                return;
            }
            if let Some(preview) = preview {
                let patch = Enrichment {
                    message_id: message.id.clone(),
                    author_name: None,
                    reply_preview: Some(preview),
                };
                let _ = self.send(Command::Enrich { epoch, patch }).await;
            }
        }
    }

    fn spawn_send(this: &Arc<Self>, epoch: u64, pending: PendingMessage) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.deliver(epoch, pending).await;
        });
    }

    async fn deliver(&self, epoch: u64, pending: PendingMessage) {
        let temp_id = pending.temp_id;
        let outgoing = OutgoingMessage {
            conversation_id: pending.conversation_id,
            user_id: pending.author_id,
            content: pending.content,
            reply_to_id: pending.reply_to_id,
        };
        let backend = &*self.backend;
        let outgoing_ref = &outgoing;
        let result = authorized(backend, move |token| backend.send_message(token, outgoing_ref))
            .await
            .map_err(ChatError::from)
            .and_then(|body| codec::decode_row(&body).map_err(ChatError::from));

        let row = match result {
            Ok(row) => row,
            Err(error) => {
                tracing::warn!(epoch, temp_id = %temp_id, error = %error, "send failed");
                let _ = self
                    .send(Command::Fail {
                        epoch,
                        temp_id,
                        error: ChatError::SendFailed(error.to_string()),
                    })
                    .await;
                return;
            }
        };

        let message = row.into_message(self.profiles.get_cached(pending.author_id));
        tracing::debug!(epoch, temp_id = %temp_id, message_id = %message.id, "send confirmed");
        let enrich = !message.author_name.is_known() || message.needs_reply_preview();
        let _ = self
            .send(Command::Confirm {
                epoch,
                temp_id,
                message: message.clone(),
            })
            .await;

        if enrich {
            let patch = self.enricher.enrich(&message).await;
            if !patch.is_empty() && self.is_current(epoch) {
                let _ = self.send(Command::Enrich { epoch, patch }).await;
            }
        }
    }
}
