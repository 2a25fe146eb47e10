//! Integration tests for the change feed: two-phase delivery, updates,
//! deletes, reconnection and reactions.

use std::sync::Arc;
use std::time::Duration;

use coursechat::error::ChatError;
use coursechat::reconcile::{ConversationView, LoadPhase};
use coursechat::session::{ChatSession, SessionConfig};
use coursechat::transport::TransportError;
use coursechat::transport::loopback::LoopbackBackend;
use coursechat_proto::message::{ConversationId, DisplayName, MessageId, Timestamp, UserId};
use coursechat_proto::wire::MessageRow;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ME: UserId = UserId::new(1);
const TIMEOUT: Duration = Duration::from_secs(5);

fn conv() -> ConversationId {
    ConversationId::new("cs101")
}

fn row(id: &str, user: u64, content: &str, at: u64) -> MessageRow {
    MessageRow {
        id: MessageId::new(id),
        conversation_id: conv(),
        user_id: UserId::new(user),
        content: content.to_string(),
        created_at: Timestamp::from_millis(at),
        edited_at: None,
        reply_to_id: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
    }
}

async fn open_with(
    backend: &Arc<LoopbackBackend>,
    config: SessionConfig,
) -> ChatSession<LoopbackBackend> {
    let session = ChatSession::start(Arc::clone(backend), config);
    session.set_active_conversation(conv()).await.unwrap();
    let mut connection = session.watch_connection();
    tokio::time::timeout(TIMEOUT, connection.wait_for(|s| s.connected))
        .await
        .expect("feed never connected")
        .unwrap();
    wait_view(&session, |v| v.phase == LoadPhase::Ready).await;
    session
}

async fn open(backend: &Arc<LoopbackBackend>) -> ChatSession<LoopbackBackend> {
    let mut config = SessionConfig::new(ME);
    config.reconnect_initial = Duration::from_millis(10);
    open_with(backend, config).await
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

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ---------------------------------------------------------------------------
// Two-phase delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn insert_shows_immediately_then_gains_author_name() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.add_profile(UserId::new(5), "Ada");
    let session = open(&backend).await;

    backend.hold_lookups(true);
    backend.insert_remote(row("m1", 5, "hi all", 1_000));
    let view = wait_view(&session, |v| v.message(&MessageId::new("m1")).is_some()).await;
    let shown = view.message(&MessageId::new("m1")).unwrap();
    assert_eq!(shown.author_name, DisplayName::Placeholder);
    assert_eq!(shown.content, "hi all");

    backend.hold_lookups(false);
    let view = wait_view(&session, |v| {
        v.message(&MessageId::new("m1"))
            .is_some_and(|m| m.author_name.is_known())
    })
    .await;
    let enriched = view.message(&MessageId::new("m1")).unwrap();
    assert_eq!(enriched.author_name, DisplayName::Known("Ada".into()));
    assert_eq!(enriched.content, "hi all");
    assert_eq!(view.len(), 1);
}

#[tokio::test]
async fn reply_to_unloaded_message_gets_fetched_preview() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.add_profile(UserId::new(2), "Grace");
    backend.seed(row("old", 2, "What does lemma 3 mean?", 10));
    backend.seed(row("recent", 3, "anyone?", 20));
    let mut config = SessionConfig::new(ME);
    config.page_size = 1;
    let session = open_with(&backend, config).await;
    assert!(session.view().message(&MessageId::new("old")).is_none());

    let mut reply = row("answer", 2, "It bounds the error term.", 1_000);
    reply.reply_to_id = Some(MessageId::new("old"));
    backend.insert_remote(reply);

    let view = wait_view(&session, |v| {
        v.message(&MessageId::new("answer"))
            .is_some_and(|m| m.reply_preview.is_some())
    })
    .await;
    let preview = view
        .message(&MessageId::new("answer"))
        .unwrap()
        .reply_preview
        .clone()
        .unwrap();
    assert_eq!(preview.excerpt, "What does lemma 3 mean?");
    assert_eq!(preview.author_name, DisplayName::Known("Grace".into()));
}

// ---------------------------------------------------------------------------
// Updates and deletes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_replaces_content_in_place() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.seed(row("m1", 2, "first draft", 10));
    backend.seed(row("m2", 2, "second", 20));
    let session = open(&backend).await;

    let mut edited = row("m1", 2, "final wording", 10);
    edited.edited_at = Some(Timestamp::from_millis(500));
    backend.update_remote(edited);

    let view = wait_view(&session, |v| {
        v.message(&MessageId::new("m1"))
            .is_some_and(|m| m.content == "final wording")
    })
    .await;
    assert_eq!(view.contents(), ["final wording", "second"]);
    assert_eq!(
        view.message(&MessageId::new("m1")).unwrap().edited_at,
        Some(Timestamp::from_millis(500))
    );
}

#[tokio::test]
async fn update_for_unknown_message_is_ignored() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.seed(row("m1", 2, "visible", 10));
    let session = open(&backend).await;

    backend.update_remote(row("ghost", 2, "never loaded", 5));
    backend.insert_remote(row("m2", 2, "marker", 30));
    let view = wait_view(&session, |v| v.message(&MessageId::new("m2")).is_some()).await;
    assert_eq!(view.contents(), ["visible", "marker"]);
}

#[tokio::test]
async fn delete_removes_message() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.seed(row("m1", 2, "keep", 10));
    backend.seed(row("m2", 2, "remove", 20));
    let session = open(&backend).await;

    backend.delete_remote(&conv(), &MessageId::new("m2"));
    let view = wait_view(&session, |v| v.message(&MessageId::new("m2")).is_none()).await;
    assert_eq!(view.contents(), ["keep"]);
}

#[tokio::test]
async fn malformed_frame_is_skipped_and_feed_survives() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = open(&backend).await;

    backend.push_raw(&conv(), b"{\"type\":\"INSERT\"".to_vec());
    backend.insert_remote(row("m1", 2, "after garbage", 10));

    let view = wait_view(&session, |v| v.message(&MessageId::new("m1")).is_some()).await;
    assert_eq!(view.len(), 1);
    assert!(session.watch_connection().borrow().connected);
}

#[tokio::test]
async fn duplicate_push_is_idempotent() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = open(&backend).await;

    let message = row("m1", 2, "once", 10);
    backend.insert_remote(message.clone());
    backend.insert_remote(message);
    backend.insert_remote(row("m2", 2, "marker", 20));

    let view = wait_view(&session, |v| v.message(&MessageId::new("m2")).is_some()).await;
    assert_eq!(view.contents(), ["once", "marker"]);
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropped_feed_reconnects_and_resumes_delivery() {
    let backend = Arc::new(LoopbackBackend::new());
    let mut config = SessionConfig::new(ME);
    config.reconnect_initial = Duration::from_millis(200);
    let session = open_with(&backend, config).await;
    let mut connection = session.watch_connection();

    backend.drop_subscriptions();
    let state = *tokio::time::timeout(TIMEOUT, connection.wait_for(|s| s.reconnecting))
        .await
        .unwrap()
        .unwrap();
    assert!(!state.connected);
    assert_eq!(state.error(), Some(ChatError::SubscriptionDropped));

    tokio::time::timeout(TIMEOUT, connection.wait_for(|s| s.connected))
        .await
        .unwrap()
        .unwrap();
    assert!(backend.subscribe_count() >= 2);

    backend.insert_remote(row("m1", 2, "after reconnect", 10));
    wait_view(&session, |v| v.message(&MessageId::new("m1")).is_some()).await;
}

#[tokio::test]
async fn failing_subscribe_keeps_retrying() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.fail_subscribes(Some(TransportError::ConnectionClosed));
    let mut config = SessionConfig::new(ME);
    config.reconnect_initial = Duration::from_millis(5);
    config.reconnect_max = Duration::from_millis(20);
    let session = ChatSession::start(Arc::clone(&backend), config);
    session.set_active_conversation(conv()).await.unwrap();

    let mut connection = session.watch_connection();
    tokio::time::timeout(TIMEOUT, connection.wait_for(|s| s.reconnecting))
        .await
        .unwrap()
        .unwrap();
    settle().await;
    assert!(backend.subscribe_count() >= 2);

    backend.fail_subscribes(None);
    tokio::time::timeout(TIMEOUT, connection.wait_for(|s| s.connected))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_closes_feed() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = open(&backend).await;
    assert_eq!(backend.subscriber_count(&conv()), 1);

    session.shutdown().await;
    settle().await;
    assert_eq!(backend.subscriber_count(&conv()), 0);
    assert!(!session.watch_connection().borrow().connected);
    assert_eq!(
        session.send_message("too late", None).await,
        Err(ChatError::NoActiveConversation)
    );
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reaction_toggle_is_optimistic() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.seed(row("m1", 2, "nice proof", 10));
    let session = open(&backend).await;
    let id = MessageId::new("m1");

    assert!(session.toggle_reaction(&id, "👍").await.unwrap());
    let view = wait_view(&session, |v| {
        v.message(&id).is_some_and(|m| !m.reactions.is_empty())
    })
    .await;
    let reaction = &view.message(&id).unwrap().reactions[0];
    assert_eq!(reaction.emoji, "👍");
    assert_eq!(reaction.count, 1);
    assert_eq!(reaction.user_ids, [ME]);

    assert!(!session.toggle_reaction(&id, "👍").await.unwrap());
    wait_view(&session, |v| v.message(&id).is_some_and(|m| m.reactions.is_empty())).await;
    assert_eq!(backend.reaction_count(), 2);
}

#[tokio::test]
async fn rejected_reaction_is_reverted() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.seed(row("m1", 2, "nice proof", 10));
    let session = open(&backend).await;
    let id = MessageId::new("m1");

    backend.fail_reactions(Some(TransportError::Timeout));
    assert_eq!(
        session.toggle_reaction(&id, "🎉").await,
        Err(ChatError::Transport(TransportError::Timeout))
    );
    let view = wait_view(&session, |v| v.message(&id).is_some_and(|m| m.reactions.is_empty())).await;
    assert_eq!(view.len(), 1);
}

#[tokio::test]
async fn reaction_on_missing_message_is_rejected() {
    let backend = Arc::new(LoopbackBackend::new());
    let session = open(&backend).await;
    assert_eq!(
        session.toggle_reaction(&MessageId::new("nope"), "👍").await,
        Err(ChatError::UnknownMessage(MessageId::new("nope")))
    );
    assert_eq!(backend.reaction_count(), 0);
}
