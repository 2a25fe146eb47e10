//! Property tests for the merge engine.
//!
//! 1. Any mix of history pages, pushes, updates and deletes leaves ids
//!    unique and rows sorted.
//! 2. Applying the same push twice looks the same as applying it once.
//! 3. Every sent message ends up as exactly one confirmed row, whichever
//!    of the push or the direct response arrives first.

use std::collections::HashSet;
use std::sync::Arc;

use coursechat::optimistic::ContentWindowMatcher;
use coursechat::reconcile::{ConversationView, Reconciler, ViewEntry};
use coursechat_proto::message::{
    ConversationId, DisplayName, Message, MessageId, PendingMessage, PendingState, TempId,
    Timestamp, UserId,
};
use proptest::prelude::*;

const POOL: usize = 12;
const ME: UserId = UserId::new(1);

fn conv() -> ConversationId {
    ConversationId::new("c1")
}

fn message(n: usize, at: u64, author: u64) -> Message {
    Message {
        id: MessageId::new(format!("m{n}")),
        conversation_id: conv(),
        author_id: UserId::new(author),
        author_name: DisplayName::Placeholder,
        content: format!("content {n}"),
        created_at: Timestamp::from_millis(at),
        edited_at: None,
        reply_to_id: None,
        reply_preview: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
    }
}

fn reconciler() -> Reconciler {
    let mut r = Reconciler::new(Arc::new(ContentWindowMatcher::default()));
    r.set_active_conversation(conv(), 1);
    r
}

#[derive(Debug, Clone)]
enum Op {
    Page { picks: Vec<usize>, prepend: bool },
    Insert(usize),
    Update(usize),
    Delete(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (prop::collection::vec(0..POOL, 0..6), any::<bool>())
            .prop_map(|(picks, prepend)| Op::Page { picks, prepend }),
        (0..POOL).prop_map(Op::Insert),
        (0..POOL).prop_map(Op::Update),
        (0..POOL).prop_map(Op::Delete),
    ]
}

fn apply(r: &mut Reconciler, pool: &[Message], op: &Op) {
    match op {
        Op::Page { picks, prepend } => {
            let mut page: Vec<Message> = picks.iter().map(|&i| pool[i].clone()).collect();
            page.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            r.apply_history_page(page, true, *prepend);
        }
        Op::Insert(i) => r.apply_live_insert(pool[*i].clone()),
        Op::Update(i) => {
            let mut edited = pool[*i].clone();
            edited.content.push_str(" (edited)");
            r.apply_live_update(edited);
        }
        Op::Delete(i) => {
            r.apply_live_delete(&pool[*i].id);
        }
    }
}

fn assert_invariants(view: &ConversationView) -> Result<(), TestCaseError> {
    let ids = view.message_ids();
    let unique: HashSet<_> = ids.iter().collect();
    prop_assert_eq!(unique.len(), ids.len(), "duplicate ids: {:?}", ids);
    prop_assert!(view.is_sorted(), "rows out of order: {:?}", view.entries);
    Ok(())
}

fn arb_pool() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec((0u64..50, 2u64..5), POOL).prop_map(|pairs| {
        pairs
            .into_iter()
            .enumerate()
            .map(|(n, (at, author))| message(n, at, author))
            .collect()
    })
}

proptest! {
    #[test]
    fn ids_stay_unique_and_sorted(
        pool in arb_pool(),
        ops in prop::collection::vec(arb_op(), 1..40),
    ) {
        let mut r = reconciler();
        for op in &ops {
            apply(&mut r, &pool, op);
            assert_invariants(&r.view())?;
        }
    }

    #[test]
    fn repeated_push_is_idempotent(
        pool in arb_pool(),
        ops in prop::collection::vec(arb_op(), 0..20),
        target in 0..POOL,
    ) {
        let mut r = reconciler();
        for op in &ops {
            apply(&mut r, &pool, op);
        }
        r.apply_live_insert(pool[target].clone());
        let once = r.view();
        r.apply_live_insert(pool[target].clone());
        prop_assert_eq!(once, r.view());
    }

    #[test]
    fn each_send_confirms_exactly_once(
        sends in prop::collection::vec((0u64..10_000, 0u64..5_000, any::<bool>()), 1..8),
        others in prop::collection::vec((0u64..15_000, 2u64..5), 0..6),
    ) {
        let mut r = reconciler();
        let mut confirmations = Vec::new();

        for (k, (at, delay, push_first)) in sends.iter().copied().enumerate() {
            let pending = PendingMessage {
                temp_id: TempId::new(),
                conversation_id: conv(),
                author_id: ME,
                author_name: DisplayName::Placeholder,
                content: format!("sent {k}"),
                created_at: Timestamp::from_millis(at),
                reply_to_id: None,
                reply_preview: None,
                state: PendingState::Sending,
            };
            let mut stored = message(100 + k, at + delay, ME.as_u64());
            stored.content = pending.content.clone();
            confirmations.push((pending.temp_id, stored, push_first));
            r.add_pending(pending);
        }
        for (n, (at, author)) in others.into_iter().enumerate() {
            r.apply_live_insert(message(200 + n, at, author));
        }

        for (temp_id, stored, push_first) in confirmations.iter().cloned() {
            if push_first {
                r.apply_live_insert(stored.clone());
                r.confirm_pending(temp_id, stored);
            } else {
                r.confirm_pending(temp_id, stored.clone());
                r.apply_live_insert(stored);
            }
            assert_invariants(&r.view())?;
        }

        let view = r.view();
        prop_assert_eq!(view.pending_count(), 0);
        for (_, stored, _) in &confirmations {
            let copies = view
                .entries
                .iter()
                .filter(|e| e.content() == stored.content)
                .collect::<Vec<&ViewEntry>>();
            prop_assert_eq!(copies.len(), 1);
            prop_assert_eq!(copies[0].message_id(), Some(&stored.id));
        }
    }
}
