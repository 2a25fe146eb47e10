//! In-process hosted backend for testing and demos.
//!
//! [`LoopbackBackend`] implements every collaborator trait over an
//! in-memory message table. Test controls allow holding requests open
//! (gates), injecting change-feed frames, dropping subscriptions,
//! expiring tokens and failing calls, and counting what the engine asked
//! for.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use coursechat_proto::codec;
use coursechat_proto::message::{ConversationId, MessageId, Timestamp, UserId};
use coursechat_proto::wire::{KeyRow, MessageRow, OutgoingMessage, PageBody, Profile, PushFrame};

use super::{
    AccessToken, AuthProvider, ChatTransport, Directory, PageRequest, PushSource, PushStream,
    TransportError,
};

type FrameSender = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

/// An open/closed latch that requests wait on.
#[derive(Debug)]
struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    fn set(&self, open: bool) {
        self.open.send_replace(open);
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Debug, Default)]
struct Counters {
    fetches: AtomicU64,
    sends: AtomicU64,
    lookups: AtomicU64,
    subscribes: AtomicU64,
    refreshes: AtomicU64,
    reactions: AtomicU64,
}

#[derive(Debug)]
struct State {
    rows: Vec<MessageRow>,
    profiles: HashMap<UserId, Profile>,
    subscribers: Vec<(ConversationId, FrameSender)>,
    token_version: u64,
    valid_from: u64,
    refresh_fixes_token: bool,
    next_id: u64,
    echo_sends: bool,
    send_failure: Option<TransportError>,
    lookup_failure: Option<TransportError>,
    subscribe_failure: Option<TransportError>,
    reaction_failure: Option<TransportError>,
    malformed_pages: bool,
    lookup_batches: Vec<Vec<UserId>>,
    fetch_gates: HashMap<ConversationId, Arc<Gate>>,
}

/// In-memory implementation of all backend collaborators.
#[derive(Debug)]
pub struct LoopbackBackend {
    state: Mutex<State>,
    send_gate: Gate,
    response_gate: Gate,
    lookup_gate: Gate,
    counters: Counters,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBackend {
    /// Creates an empty backend with a valid token and open gates.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                rows: Vec::new(),
                profiles: HashMap::new(),
                subscribers: Vec::new(),
                token_version: 1,
                valid_from: 1,
                refresh_fixes_token: true,
                next_id: 1,
                echo_sends: true,
                send_failure: None,
                lookup_failure: None,
                subscribe_failure: None,
                reaction_failure: None,
                malformed_pages: false,
                lookup_batches: Vec::new(),
                fetch_gates: HashMap::new(),
            }),
            send_gate: Gate::new(),
            response_gate: Gate::new(),
            lookup_gate: Gate::new(),
            counters: Counters::default(),
        }
    }

    // --- seeding ---

    /// Registers a directory profile.
    pub fn add_profile(&self, user_id: UserId, display_name: &str) {
        self.state.lock().profiles.insert(
            user_id,
            Profile {
                user_id,
                display_name: display_name.to_string(),
                avatar_ref: None,
            },
        );
    }

    /// Stores a row without notifying subscribers.
    pub fn seed(&self, row: MessageRow) {
        self.state.lock().rows.push(row);
    }

    /// Sets the numeric suffix of the next server-assigned id (`m{n}`).
    pub fn set_next_id(&self, next: u64) {
        self.state.lock().next_id = next;
    }

    /// Whether accepted sends are echoed on the change feed (default on).
    pub fn set_echo_sends(&self, echo: bool) {
        self.state.lock().echo_sends = echo;
    }

    // --- gates ---

    /// Holds (or releases) history fetches for one conversation.
    pub fn hold_fetches(&self, conversation: &ConversationId, hold: bool) {
        let gate = Arc::clone(
            self.state
                .lock()
                .fetch_gates
                .entry(conversation.clone())
                .or_insert_with(|| Arc::new(Gate::new())),
        );
        gate.set(!hold);
    }

    /// Holds (or releases) sends before the backend accepts them.
    pub fn hold_sends(&self, hold: bool) {
        self.send_gate.set(!hold);
    }

    /// Holds (or releases) send responses after the row was stored and echoed.
    pub fn hold_send_responses(&self, hold: bool) {
        self.response_gate.set(!hold);
    }

    /// Holds (or releases) directory lookups.
    pub fn hold_lookups(&self, hold: bool) {
        self.lookup_gate.set(!hold);
    }

    // --- failure injection ---

    /// Makes every send fail with `error` until cleared with `None`.
    pub fn fail_sends(&self, error: Option<TransportError>) {
        self.state.lock().send_failure = error;
    }

    /// Makes every directory lookup fail until cleared.
    pub fn fail_lookups(&self, error: Option<TransportError>) {
        self.state.lock().lookup_failure = error;
    }

    /// Makes every subscribe attempt fail until cleared.
    pub fn fail_subscribes(&self, error: Option<TransportError>) {
        self.state.lock().subscribe_failure = error;
    }

    /// Makes every reaction toggle fail until cleared.
    pub fn fail_reactions(&self, error: Option<TransportError>) {
        self.state.lock().reaction_failure = error;
    }

    /// Returns undecodable bodies for history fetches.
    pub fn serve_malformed_pages(&self, malformed: bool) {
        self.state.lock().malformed_pages = malformed;
    }

    /// Invalidates every token issued so far so the next call returns
    /// `Unauthorized`.
    pub fn expire_token(&self) {
        let mut state = self.state.lock();
        state.valid_from = state.token_version + 1;
    }

    /// When `false`, refreshed tokens are rejected too.
    pub fn set_refresh_fixes_token(&self, fixes: bool) {
        self.state.lock().refresh_fixes_token = fixes;
    }

    // --- change feed ---

    /// Stores a row and pushes an `INSERT` frame.
    pub fn insert_remote(&self, row: MessageRow) {
        let conversation = row.conversation_id.clone();
        self.state.lock().rows.push(row.clone());
        self.push(&conversation, &PushFrame::Insert { record: row });
    }

    /// Replaces a stored row and pushes an `UPDATE` frame.
    pub fn update_remote(&self, row: MessageRow) {
        let conversation = row.conversation_id.clone();
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.rows.iter_mut().find(|r| r.id == row.id) {
                *existing = row.clone();
            }
        }
        self.push(&conversation, &PushFrame::Update { record: row });
    }

    /// Deletes a stored row and pushes a `DELETE` frame.
    pub fn delete_remote(&self, conversation: &ConversationId, id: &MessageId) {
        self.state.lock().rows.retain(|r| r.id != *id);
        self.push(
            conversation,
            &PushFrame::Delete {
                old_record: KeyRow { id: id.clone() },
            },
        );
    }

    /// Pushes a frame to subscribers of `conversation` without touching storage.
    pub fn push(&self, conversation: &ConversationId, frame: &PushFrame) {
        match codec::encode(frame) {
            Ok(bytes) => self.push_raw(conversation, bytes),
            Err(e) => tracing::warn!(error = %e, "loopback failed to encode frame"),
        }
    }

    /// Pushes raw bytes to subscribers of `conversation`.
    pub fn push_raw(&self, conversation: &ConversationId, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        for (conv, tx) in &state.subscribers {
            if conv == conversation {
                let _ = tx.send(Ok(bytes.clone()));
            }
        }
    }

    /// Ends every open change feed, as a network drop would.
    pub fn drop_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Number of live change feeds for `conversation`.
    #[must_use]
    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|(conv, _)| conv == conversation)
            .count()
    }

    // --- counters ---

    /// History fetches received (including held ones).
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.counters.fetches.load(Ordering::SeqCst)
    }

    /// Send requests received (including held and failed ones).
    #[must_use]
    pub fn send_count(&self) -> u64 {
        self.counters.sends.load(Ordering::SeqCst)
    }

    /// Directory lookups received.
    #[must_use]
    pub fn lookup_count(&self) -> u64 {
        self.counters.lookups.load(Ordering::SeqCst)
    }

    /// Ids requested by each directory lookup, in call order.
    #[must_use]
    pub fn lookup_batches(&self) -> Vec<Vec<UserId>> {
        self.state.lock().lookup_batches.clone()
    }

    /// Subscribe calls received.
    #[must_use]
    pub fn subscribe_count(&self) -> u64 {
        self.counters.subscribes.load(Ordering::SeqCst)
    }

    /// Token refreshes performed.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.counters.refreshes.load(Ordering::SeqCst)
    }

    /// Reaction toggles received.
    #[must_use]
    pub fn reaction_count(&self) -> u64 {
        self.counters.reactions.load(Ordering::SeqCst)
    }

    /// Stored rows for a conversation, oldest first.
    #[must_use]
    pub fn rows(&self, conversation: &ConversationId) -> Vec<MessageRow> {
        let mut rows: Vec<MessageRow> = self
            .state
            .lock()
            .rows
            .iter()
            .filter(|r| r.conversation_id == *conversation)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        rows
    }

    fn check_token(&self, token: &AccessToken) -> Result<(), TransportError> {
        let valid_from = self.state.lock().valid_from;
        let version = token
            .as_str()
            .strip_prefix("token-")
            .and_then(|v| v.parse::<u64>().ok());
        match version {
            Some(v) if v >= valid_from => Ok(()),
            _ => Err(TransportError::Unauthorized),
        }
    }

    fn fetch_gate(&self, conversation: &ConversationId) -> Option<Arc<Gate>> {
        self.state.lock().fetch_gates.get(conversation).cloned()
    }
}

impl AuthProvider for LoopbackBackend {
    async fn access_token(&self) -> Result<AccessToken, TransportError> {
        let version = self.state.lock().token_version;
        Ok(AccessToken::new(format!("token-{version}")))
    }

    async fn refresh(&self) -> Result<AccessToken, TransportError> {
        self.counters.refreshes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.token_version += 1;
        if !state.refresh_fixes_token {
            state.valid_from = state.token_version + 1;
        }
        Ok(AccessToken::new(format!("token-{}", state.token_version)))
    }
}

impl ChatTransport for LoopbackBackend {
    async fn fetch_page(
        &self,
        token: AccessToken,
        request: &PageRequest,
    ) -> Result<Vec<u8>, TransportError> {
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.fetch_gate(&request.conversation_id) {
            gate.pass().await;
        }
        self.check_token(&token)?;
        if self.state.lock().malformed_pages {
            return Ok(b"{\"messages\": [".to_vec());
        }

        let mut rows: Vec<MessageRow> = self
            .rows(&request.conversation_id)
            .into_iter()
            .filter(|r| request.before.is_none_or(|before| r.created_at < before))
            .collect();
        rows.reverse();
        let has_more = rows.len() > request.limit;
        rows.truncate(request.limit);

        codec::encode(&PageBody {
            messages: rows,
            has_more: Some(has_more),
        })
        .map_err(|e| TransportError::Status {
            status: 500,
            reason: e.to_string(),
        })
    }

    async fn send_message(
        &self,
        token: AccessToken,
        message: &OutgoingMessage,
    ) -> Result<Vec<u8>, TransportError> {
        self.counters.sends.fetch_add(1, Ordering::SeqCst);
        self.send_gate.pass().await;
        self.check_token(&token)?;

        let (row, echo) = {
            let mut state = self.state.lock();
            if let Some(err) = state.send_failure.clone() {
                return Err(err);
            }
            let id = MessageId::new(format!("m{}", state.next_id));
            state.next_id += 1;
            let row = MessageRow {
                id,
                conversation_id: message.conversation_id.clone(),
                user_id: message.user_id,
                content: message.content.clone(),
                created_at: Timestamp::now(),
                edited_at: None,
                reply_to_id: message.reply_to_id.clone(),
                attachments: Vec::new(),
                reactions: Vec::new(),
            };
            state.rows.push(row.clone());
            (row, state.echo_sends)
        };

        if echo {
            self.push(
                &row.conversation_id,
                &PushFrame::Insert {
                    record: row.clone(),
                },
            );
        }

        self.response_gate.pass().await;
        codec::encode(&row).map_err(|e| TransportError::Status {
            status: 500,
            reason: e.to_string(),
        })
    }

    async fn fetch_message(
        &self,
        token: AccessToken,
        id: &MessageId,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_token(&token)?;
        let row = self
            .state
            .lock()
            .rows
            .iter()
            .find(|r| r.id == *id)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(id.to_string()))?;
        codec::encode(&row).map_err(|e| TransportError::Status {
            status: 500,
            reason: e.to_string(),
        })
    }

    async fn toggle_reaction(
        &self,
        token: AccessToken,
        _id: &MessageId,
        _emoji: &str,
    ) -> Result<(), TransportError> {
        self.counters.reactions.fetch_add(1, Ordering::SeqCst);
        self.check_token(&token)?;
        match self.state.lock().reaction_failure.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl PushSource for LoopbackBackend {
    async fn subscribe(
        &self,
        token: AccessToken,
        conversation: &ConversationId,
    ) -> Result<PushStream, TransportError> {
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        self.check_token(&token)?;
        let mut state = self.state.lock();
        if let Some(err) = state.subscribe_failure.clone() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push((conversation.clone(), tx));

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(stream.boxed())
    }
}

impl Directory for LoopbackBackend {
    async fn lookup_profiles(
        &self,
        token: AccessToken,
        ids: &[UserId],
    ) -> Result<Vec<Profile>, TransportError> {
        self.counters.lookups.fetch_add(1, Ordering::SeqCst);
        self.lookup_gate.pass().await;
        self.check_token(&token)?;
        let mut state = self.state.lock();
        state.lookup_batches.push(ids.to_vec());
        if let Some(err) = state.lookup_failure.clone() {
            return Err(err);
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.profiles.get(id).cloned())
            .collect())
    }
}
