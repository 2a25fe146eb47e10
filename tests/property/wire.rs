//! Property tests for the backend wire format.
//!
//! 1. Arbitrary bytes never panic any decoder.
//! 2. Any valid push frame survives encode -> decode.
//! 3. Truncating a valid frame yields `Malformed`, never a partial frame.

use coursechat_proto::codec::{self, CodecError};
use coursechat_proto::message::{ConversationId, MessageId, Timestamp, UserId};
use coursechat_proto::wire::{KeyRow, MessageRow, PushFrame, ReactionRow};
use proptest::prelude::*;

fn arb_row() -> impl Strategy<Value = MessageRow> {
    (
        "[a-z0-9]{1,12}",
        "[a-z0-9]{1,8}",
        any::<u64>(),
        "[^\x00]{0,256}",
        any::<u64>(),
        prop::option::of("[a-z0-9]{1,12}"),
        prop::collection::vec(any::<u64>(), 0..4),
    )
        .prop_map(|(id, conv, user, content, ts, reply, reactors)| MessageRow {
            id: MessageId::new(id),
            conversation_id: ConversationId::new(conv),
            user_id: UserId::new(user),
            content,
            created_at: Timestamp::from_millis(ts),
            edited_at: None,
            reply_to_id: reply.map(MessageId::new),
            attachments: Vec::new(),
            reactions: vec![ReactionRow {
                emoji: "👍".into(),
                user_ids: reactors.into_iter().map(UserId::new).collect(),
                count: None,
            }],
        })
}

fn arb_frame() -> impl Strategy<Value = PushFrame> {
    prop_oneof![
        arb_row().prop_map(|record| PushFrame::Insert { record }),
        arb_row().prop_map(|record| PushFrame::Update { record }),
        "[a-z0-9]{1,12}".prop_map(|id| PushFrame::Delete {
            old_record: KeyRow {
                id: MessageId::new(id)
            }
        }),
    ]
}

proptest! {
    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode_push(&bytes);
        let _ = codec::decode_page(&bytes);
        let _ = codec::decode_row(&bytes);
    }

    #[test]
    fn frame_survives_encoding(frame in arb_frame()) {
        let bytes = codec::encode(&frame).unwrap();
        prop_assert_eq!(codec::decode_push(&bytes).unwrap(), frame);
    }

    #[test]
    fn truncated_frame_is_malformed(frame in arb_frame(), cut in 1usize..16) {
        let bytes = codec::encode(&frame).unwrap();
        let end = bytes.len().saturating_sub(cut);
        let result = codec::decode_push(&bytes[..end]);
        prop_assert!(matches!(result, Err(CodecError::Malformed(_))));
    }
}
