//! Integration tests for switching the active conversation while work for
//! the previous one is still in flight.

use std::sync::Arc;
use std::time::Duration;

use coursechat::reconcile::{ConversationView, LoadPhase};
use coursechat::session::{ChatSession, SessionConfig};
use coursechat::transport::loopback::LoopbackBackend;
use coursechat_proto::message::{ConversationId, MessageId, Timestamp, UserId};
use coursechat_proto::wire::MessageRow;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ME: UserId = UserId::new(1);
const TIMEOUT: Duration = Duration::from_secs(5);

fn room_a() -> ConversationId {
    ConversationId::new("room-a")
}

fn room_b() -> ConversationId {
    ConversationId::new("room-b")
}

fn row(conversation: &ConversationId, id: &str, user: u64, at: u64) -> MessageRow {
    MessageRow {
        id: MessageId::new(id),
        conversation_id: conversation.clone(),
        user_id: UserId::new(user),
        content: format!("{conversation}: {id}"),
        created_at: Timestamp::from_millis(at),
        edited_at: None,
        reply_to_id: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
    }
}

fn seeded() -> Arc<LoopbackBackend> {
    let backend = Arc::new(LoopbackBackend::new());
    for n in 1..=3 {
        backend.seed(row(&room_a(), &format!("a{n}"), 2, n * 10));
        backend.seed(row(&room_b(), &format!("b{n}"), 3, n * 10));
    }
    backend
}

fn start(backend: &Arc<LoopbackBackend>) -> ChatSession<LoopbackBackend> {
    let mut config = SessionConfig::new(ME);
    config.reconnect_initial = Duration::from_millis(10);
    ChatSession::start(Arc::clone(backend), config)
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

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn assert_only_room_b(view: &ConversationView) {
    assert_eq!(view.conversation_id, Some(room_b()));
    for entry in &view.entries {
        assert!(
            entry.content().starts_with("room-b"),
            "foreign row in room-b: {entry:?}"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_history_for_previous_conversation_is_dropped() {
    let backend = seeded();
    let session = start(&backend);

    backend.hold_fetches(&room_a(), true);
    session.set_active_conversation(room_a()).await.unwrap();
    wait_until(|| backend.fetch_count() >= 1).await;

    session.set_active_conversation(room_b()).await.unwrap();
    let view = wait_view(&session, |v| {
        v.conversation_id == Some(room_b()) && v.phase == LoadPhase::Ready
    })
    .await;
    assert_eq!(view.len(), 3);

    backend.hold_fetches(&room_a(), false);
    settle().await;

    let view = session.view();
    assert_only_room_b(&view);
    assert_eq!(view.len(), 3);
    assert_eq!(session.active_conversation(), Some(room_b()));
}

#[tokio::test]
async fn previous_feed_is_closed_and_its_pushes_ignored() {
    let backend = seeded();
    let session = start(&backend);

    session.set_active_conversation(room_a()).await.unwrap();
    wait_until(|| backend.subscriber_count(&room_a()) == 1).await;

    session.set_active_conversation(room_b()).await.unwrap();
    wait_until(|| backend.subscriber_count(&room_b()) == 1).await;
    wait_until(|| backend.subscriber_count(&room_a()) == 0).await;
    wait_view(&session, |v| {
        v.conversation_id == Some(room_b()) && v.phase == LoadPhase::Ready
    })
    .await;

    backend.insert_remote(row(&room_a(), "a-late", 2, 1_000));
    backend.insert_remote(row(&room_b(), "b-live", 3, 1_000));
    let view = wait_view(&session, |v| v.message(&MessageId::new("b-live")).is_some()).await;
    assert_only_room_b(&view);
    assert!(view.message(&MessageId::new("a-late")).is_none());
}

#[tokio::test]
async fn enrichment_resolving_after_switch_is_not_applied() {
    let backend = seeded();
    backend.add_profile(UserId::new(9), "Late Larry");
    let session = start(&backend);

    session.set_active_conversation(room_a()).await.unwrap();
    let mut connection = session.watch_connection();
    tokio::time::timeout(TIMEOUT, connection.wait_for(|s| s.connected))
        .await
        .unwrap()
        .unwrap();
    wait_view(&session, |v| v.phase == LoadPhase::Ready).await;

    backend.hold_lookups(true);
    backend.insert_remote(row(&room_a(), "a-unknown", 9, 1_000));
    wait_view(&session, |v| v.message(&MessageId::new("a-unknown")).is_some()).await;

    session.set_active_conversation(room_b()).await.unwrap();
    wait_view(&session, |v| {
        v.conversation_id == Some(room_b()) && v.phase == LoadPhase::Ready
    })
    .await;

    backend.hold_lookups(false);
    settle().await;
    assert_only_room_b(&session.view());
}

#[tokio::test]
async fn pending_send_from_previous_conversation_does_not_follow() {
    let backend = seeded();
    let session = start(&backend);

    session.set_active_conversation(room_a()).await.unwrap();
    wait_view(&session, |v| v.phase == LoadPhase::Ready).await;

    backend.hold_sends(true);
    let temp_id = session.send_message("for room a", None).await.unwrap();
    wait_view(&session, |v| v.pending(&temp_id).is_some()).await;

    session.set_active_conversation(room_b()).await.unwrap();
    let view = wait_view(&session, |v| {
        v.conversation_id == Some(room_b()) && v.phase == LoadPhase::Ready
    })
    .await;
    assert_eq!(view.pending_count(), 0);

    backend.hold_sends(false);
    settle().await;
    let view = session.view();
    assert_only_room_b(&view);
    assert_eq!(view.pending_count(), 0);
    // The send itself still reached the server.
    assert_eq!(backend.rows(&room_a()).len(), 4);
}

#[tokio::test]
async fn switching_back_reloads_from_scratch() {
    let backend = seeded();
    let session = start(&backend);

    session.set_active_conversation(room_a()).await.unwrap();
    wait_view(&session, |v| v.phase == LoadPhase::Ready).await;
    session.set_active_conversation(room_b()).await.unwrap();
    wait_view(&session, |v| {
        v.conversation_id == Some(room_b()) && v.phase == LoadPhase::Ready
    })
    .await;
    session.set_active_conversation(room_a()).await.unwrap();

    let view = wait_view(&session, |v| {
        v.conversation_id == Some(room_a()) && v.phase == LoadPhase::Ready
    })
    .await;
    let ids: Vec<_> = view.message_ids().into_iter().map(MessageId::as_str).collect();
    assert_eq!(ids, ["a1", "a2", "a3"]);
}
