//! Integration tests for sending: optimistic display, confirmation by the
//! direct response or by the change feed, failure and retry.
//!
//! Runs a full [`ChatSession`] against the in-process backend and observes
//! only the published view and backend counters.

use std::sync::Arc;
use std::time::Duration;

use coursechat::error::ChatError;
use coursechat::reconcile::{ConversationView, LoadPhase, ViewEntry};
use coursechat::session::{ChatSession, SessionConfig};
use coursechat::transport::TransportError;
use coursechat::transport::loopback::LoopbackBackend;
use coursechat_proto::message::{
    ConversationId, DisplayName, MAX_CONTENT_CHARS, MessageId, PendingState, Timestamp, UserId,
    ValidationError,
};
use coursechat_proto::wire::MessageRow;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ME: UserId = UserId::new(1);
const TIMEOUT: Duration = Duration::from_secs(5);

fn conv() -> ConversationId {
    ConversationId::new("cs101")
}

fn config() -> SessionConfig {
    let mut config = SessionConfig::new(ME);
    config.reconnect_initial = Duration::from_millis(10);
    config
}

/// Starts a session on `conv()` with the live feed connected and the
/// initial page applied.
async fn open(backend: &Arc<LoopbackBackend>) -> ChatSession<LoopbackBackend> {
    let session = ChatSession::start(Arc::clone(backend), config());
    session.set_active_conversation(conv()).await.unwrap();
    let mut connection = session.watch_connection();
    tokio::time::timeout(TIMEOUT, connection.wait_for(|s| s.connected))
        .await
        .expect("feed never connected")
        .unwrap();
    wait_view(&session, |v| v.phase == LoadPhase::Ready).await;
    session
}

async fn wait_view(
    session: &ChatSession<LoopbackBackend>,
    done: impl FnMut(&ConversationView) -> bool,
) -> ConversationView {
    let mut view = session.watch_view();
    let snapshot = tokio::time::timeout(TIMEOUT, view.wait_for(done))
        .await
        .expect("view never reached expected state")
        .unwrap()
        .clone();
    snapshot
}

/// Lets spawned tasks that are not observable through the view finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn count(view: &ConversationView, content: &str) -> usize {
    view.entries.iter().filter(|e| e.content() == content).count()
}

// ---------------------------------------------------------------------------
// Direct confirmation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_send_shows_pending_then_confirms_with_server_id() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.set_echo_sends(false);
    backend.set_next_id(42);
    let session = open(&backend).await;

    backend.hold_sends(true);
    let temp_id = session.send_message("hello", None).await.unwrap();

    let view = wait_view(&session, |v| v.pending(&temp_id).is_some()).await;
    let pending = view.pending(&temp_id).unwrap();
    assert_eq!(pending.state, PendingState::Sending);
    assert_eq!(pending.content, "hello");

    backend.hold_sends(false);
    let view = wait_view(&session, |v| v.message(&MessageId::new("m42")).is_some()).await;
    assert_eq!(view.pending_count(), 0);
    assert_eq!(count(&view, "hello"), 1);
    assert_eq!(view.message_ids(), [&MessageId::new("m42")]);
    assert_eq!(backend.send_count(), 1);
}

#[tokio::test]
async fn concurrent_sends_each_confirm_once() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.set_echo_sends(false);
    let session = open(&backend).await;

    backend.hold_sends(true);
    let first = session.send_message("first", None).await.unwrap();
    let second = session.send_message("second", None).await.unwrap();
    let view = wait_view(&session, |v| v.pending_count() == 2).await;
    assert_eq!(view.contents(), ["first", "second"]);

    backend.hold_sends(false);
    let view = wait_view(&session, |v| v.pending_count() == 0 && v.len() == 2).await;
    assert!(view.is_sorted());
    assert_eq!(count(&view, "first"), 1);
    assert_eq!(count(&view, "second"), 1);
    assert!(view.pending(&first).is_none());
    assert!(view.pending(&second).is_none());
}

// ---------------------------------------------------------------------------
// Push arrives before the response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_before_response_never_duplicates() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.set_next_id(42);
    let session = open(&backend).await;

    backend.hold_send_responses(true);
    let temp_id = session.send_message("hello", None).await.unwrap();

    // The echo replaces the pending row while the response is still held.
    let view = wait_view(&session, |v| v.message(&MessageId::new("m42")).is_some()).await;
    assert!(view.pending(&temp_id).is_none());
    assert_eq!(count(&view, "hello"), 1);

    backend.hold_send_responses(false);
    settle().await;

    let view = session.view();
    assert_eq!(count(&view, "hello"), 1);
    assert_eq!(view.pending_count(), 0);
    assert_eq!(view.message_ids(), [&MessageId::new("m42")]);
}

#[tokio::test]
async fn pushed_copy_from_another_author_is_not_merged() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = open(&backend).await;

    backend.hold_sends(true);
    let temp_id = session.send_message("same words", None).await.unwrap();
    wait_view(&session, |v| v.pending(&temp_id).is_some()).await;

    backend.insert_remote(MessageRow {
        id: MessageId::new("other-1"),
        conversation_id: conv(),
        user_id: UserId::new(99),
        content: "same words".into(),
        created_at: Timestamp::now(),
        edited_at: None,
        reply_to_id: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
    });
    let view = wait_view(&session, |v| v.message(&MessageId::new("other-1")).is_some()).await;
    assert!(view.pending(&temp_id).is_some());
    assert_eq!(count(&view, "same words"), 2);

    backend.hold_sends(false);
    let view = wait_view(&session, |v| v.pending_count() == 0 && v.len() == 2).await;
    assert_eq!(count(&view, "same words"), 2);
}

// ---------------------------------------------------------------------------
// Failure and retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_send_keeps_content_and_retry_confirms_once() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.set_echo_sends(false);
    backend.set_next_id(7);
    let session = open(&backend).await;

    backend.fail_sends(Some(TransportError::ConnectionClosed));
    let temp_id = session.send_message("retry me", None).await.unwrap();
    let view = wait_view(&session, |v| v.pending(&temp_id).is_some_and(|p| p.is_failed())).await;
    assert_eq!(view.pending(&temp_id).unwrap().content, "retry me");

    backend.fail_sends(None);
    backend.hold_sends(true);
    session.retry(temp_id).await.unwrap();
    assert_eq!(
        session.retry(temp_id).await,
        Err(ChatError::RetryInFlight(temp_id))
    );

    backend.hold_sends(false);
    let view = wait_view(&session, |v| v.message(&MessageId::new("m7")).is_some()).await;
    assert_eq!(view.pending_count(), 0);
    assert_eq!(count(&view, "retry me"), 1);
    assert_eq!(view.message(&MessageId::new("m7")).unwrap().content, "retry me");

    settle().await;
    assert_eq!(backend.send_count(), 2);
    assert_eq!(backend.rows(&conv()).len(), 1);
}

#[tokio::test]
async fn dismissing_a_failed_message_removes_it() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = open(&backend).await;

    backend.fail_sends(Some(TransportError::Timeout));
    let temp_id = session.send_message("never mind", None).await.unwrap();
    wait_view(&session, |v| v.pending(&temp_id).is_some_and(|p| p.is_failed())).await;

    session.dismiss(temp_id).await.unwrap();
    let view = wait_view(&session, |v| v.pending(&temp_id).is_none()).await;
    assert!(view.is_empty());

    assert_eq!(
        session.dismiss(temp_id).await,
        Err(ChatError::UnknownPending(temp_id))
    );
    assert_eq!(
        session.retry(temp_id).await,
        Err(ChatError::UnknownPending(temp_id))
    );
}

#[tokio::test]
async fn failure_reason_is_visible_on_the_row() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = open(&backend).await;

    backend.fail_sends(Some(TransportError::Status {
        status: 503,
        reason: "maintenance".into(),
    }));
    let temp_id = session.send_message("hi", None).await.unwrap();
    let view = wait_view(&session, |v| v.pending(&temp_id).is_some_and(|p| p.is_failed())).await;
    let entry = view
        .entries
        .iter()
        .find(|e| e.temp_id() == Some(temp_id))
        .unwrap();
    assert!(entry.is_failed());
    match &entry.as_pending().unwrap().state {
        PendingState::Failed { error } => assert!(error.contains("maintenance")),
        PendingState::Sending => panic!("expected failed state"),
    }
}

// ---------------------------------------------------------------------------
// Validation and replies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_content_is_rejected_without_sending() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = open(&backend).await;

    assert_eq!(
        session.send_message("   \n", None).await,
        Err(ChatError::Validation(ValidationError::Empty))
    );
    let too_long = "x".repeat(MAX_CONTENT_CHARS + 1);
    assert!(matches!(
        session.send_message(&too_long, None).await,
        Err(ChatError::Validation(ValidationError::TooLong { .. }))
    ));

    settle().await;
    assert_eq!(backend.send_count(), 0);
    assert!(session.view().is_empty());
}

#[tokio::test]
async fn send_without_conversation_is_rejected() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = ChatSession::start(Arc::clone(&backend), config());
    assert_eq!(
        session.send_message("hello", None).await,
        Err(ChatError::NoActiveConversation)
    );
}

#[tokio::test]
async fn reply_carries_preview_of_visible_target() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.add_profile(UserId::new(2), "Ada");
    backend.add_profile(ME, "Me");
    backend.seed(MessageRow {
        id: MessageId::new("q1"),
        conversation_id: conv(),
        user_id: UserId::new(2),
        content: "When is the quiz?".into(),
        created_at: Timestamp::from_millis(1_000),
        edited_at: None,
        reply_to_id: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
    });
    let session = open(&backend).await;
    wait_view(&session, |v| {
        v.message(&MessageId::new("q1"))
            .is_some_and(|m| m.author_name.is_known())
    })
    .await;

    backend.set_echo_sends(false);
    backend.hold_sends(true);
    let temp_id = session
        .send_message("Thursday", Some(MessageId::new("q1")))
        .await
        .unwrap();
    let view = wait_view(&session, |v| v.pending(&temp_id).is_some()).await;
    let preview = view.pending(&temp_id).unwrap().reply_preview.clone().unwrap();
    assert_eq!(preview.excerpt, "When is the quiz?");
    assert_eq!(preview.author_name, DisplayName::Known("Ada".into()));

    backend.hold_sends(false);
    let view = wait_view(&session, |v| v.pending_count() == 0 && v.len() == 2).await;
    let reply = view
        .entries
        .iter()
        .filter_map(ViewEntry::as_message)
        .find(|m| m.content == "Thursday")
        .unwrap();
    assert_eq!(reply.reply_to_id, Some(MessageId::new("q1")));
    assert_eq!(reply.reply_preview.as_ref().unwrap().excerpt, "When is the quiz?");
}
