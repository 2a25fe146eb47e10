//! Error taxonomy surfaced by the reconciliation engine.

use coursechat_proto::codec::CodecError;
use coursechat_proto::message::{MessageId, TempId, ValidationError};

use crate::transport::TransportError;

/// Errors surfaced to callers of [`crate::session::ChatSession`] and
/// recorded on [`crate::reconcile::ConversationView`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// The token was rejected even after one refresh.
    #[error("authentication expired")]
    AuthExpired,

    /// A backend call failed. Visible state is left untouched.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Content was rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A backend body could not be decoded.
    #[error("malformed payload: {0}")]
    Malformed(#[from] CodecError),

    /// An optimistic send failed; the bubble stays with a retry affordance.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The change feed dropped; reconnect is in progress. Reported through
    /// [`crate::live::ConnectionState::error`], never returned by a call.
    #[error("subscription dropped")]
    SubscriptionDropped,

    /// A send attempt for this message is still in flight.
    #[error("a send for {0} is already in flight")]
    RetryInFlight(TempId),

    /// No pending message with this id is visible.
    #[error("no pending message {0}")]
    UnknownPending(TempId),

    /// No confirmed message with this id is visible.
    #[error("no message {0} in the active conversation")]
    UnknownMessage(MessageId),

    /// The operation needs an active conversation.
    #[error("no active conversation")]
    NoActiveConversation,

    /// The session worker has shut down.
    #[error("session closed")]
    SessionClosed,
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized => Self::AuthExpired,
            other => Self::Transport(other),
        }
    }
}
