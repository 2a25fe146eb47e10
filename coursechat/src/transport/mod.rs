//! Collaborator interfaces consumed by the reconciliation engine.
//!
//! The engine never talks to the hosted backend directly. It goes through
//! four narrow traits:
//! - [`AuthProvider`]: access tokens and refresh
//! - [`ChatTransport`]: request/response calls (history, send, reactions)
//! - [`PushSource`]: the per-conversation change feed
//! - [`Directory`]: user id to profile resolution
//!
//! [`loopback::LoopbackBackend`] implements all four in-process for tests
//! and the demo binary.

pub mod auth;
pub mod loopback;

use std::fmt;
use std::future::Future;

use futures_util::stream::BoxStream;

use coursechat_proto::message::{ConversationId, MessageId, Timestamp, UserId};
use coursechat_proto::wire::{OutgoingMessage, Profile};

pub use auth::authorized;

/// Bearer token attached to every backend call.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// Errors returned by collaborator calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The token was rejected (HTTP 401 or equivalent).
    #[error("unauthorized")]
    Unauthorized,

    /// The connection is closed or the backend is unreachable.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {reason}")]
    Status {
        /// Status code.
        status: u16,
        /// Reason reported by the backend.
        reason: String,
    },

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Parameters for one history page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Conversation to page through.
    pub conversation_id: ConversationId,
    /// Only rows strictly older than this; `None` means the newest page.
    pub before: Option<Timestamp>,
    /// Maximum rows to return.
    pub limit: usize,
}

/// A live change feed: raw frames until the subscription drops.
///
/// The stream ending, or yielding an error, means the subscription was
/// lost and must be re-established.
pub type PushStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Issues and refreshes access tokens.
pub trait AuthProvider: Send + Sync {
    /// Returns the current access token.
    fn access_token(&self) -> impl Future<Output = Result<AccessToken, TransportError>> + Send;

    /// Forces a token refresh and returns the new token.
    fn refresh(&self) -> impl Future<Output = Result<AccessToken, TransportError>> + Send;
}

/// Request/response calls against the hosted backend.
///
/// Bodies are returned as raw JSON bytes; decoding (and deciding what
/// counts as malformed) is the engine's job.
pub trait ChatTransport: Send + Sync {
    /// Fetches one history page. Rows are ordered newest-first.
    fn fetch_page(
        &self,
        token: AccessToken,
        request: &PageRequest,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Sends a message and returns the stored row.
    fn send_message(
        &self,
        token: AccessToken,
        message: &OutgoingMessage,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Fetches a single row by id.
    fn fetch_message(
        &self,
        token: AccessToken,
        id: &MessageId,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Toggles the caller's `emoji` reaction on a message.
    fn toggle_reaction(
        &self,
        token: AccessToken,
        id: &MessageId,
        emoji: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Source of per-conversation change feeds.
pub trait PushSource: Send + Sync {
    /// Opens a change feed filtered to one conversation.
    fn subscribe(
        &self,
        token: AccessToken,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<PushStream, TransportError>> + Send;
}

/// Resolves user ids to profiles.
pub trait Directory: Send + Sync {
    /// Looks up a batch of users. Unknown ids are simply absent.
    fn lookup_profiles(
        &self,
        token: AccessToken,
        ids: &[UserId],
    ) -> impl Future<Output = Result<Vec<Profile>, TransportError>> + Send;
}

/// Everything a [`crate::session::ChatSession`] needs from the outside world.
pub trait Backend: AuthProvider + ChatTransport + PushSource + Directory + 'static {}

impl<T> Backend for T where T: AuthProvider + ChatTransport + PushSource + Directory + 'static {}
