#![allow(clippy::unwrap_used, clippy::expect_used, clippy::doc_markdown)]

//! Property-based tests for the message store.
//!
//! Whatever order live events, history pages, deletes and optimistic sends
//! arrive in, the store must:
//! 1. hold every id at most once,
//! 2. stay sorted by `(created_at, id)`,
//! 3. end in the same state for the same set of confirmed messages.

use areachat::chat::store::MessageStore;
use areachat_proto::message::*;
use proptest::prelude::*;

fn message(id: u8, millis: u64) -> Message {
    Message {
        id: MessageId::new(format!("m{id:03}")),
        author: Author {
            user_id: Some(UserId::new("u1")),
            display_name: "Ana".into(),
            avatar_url: None,
        },
        body: format!("body {id}"),
        kind: MessageKind::Text,
        created_at: Timestamp::from_millis(millis),
        edited_at: None,
        provenance: Provenance::Web,
        telegram: None,
        client_nonce: None,
        timestamp_estimated: false,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Live(u8),
    Page(Vec<u8>, bool),
    Remove(u8),
    Pending(u64),
}

/// Ids from a small pool so duplicates are frequent; each id has one fixed
/// timestamp, as a real backend would.
fn stamp(id: u8) -> u64 {
    1_700_000_000_000 + u64::from(id % 16) * 60_000
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..40u8).prop_map(Op::Live),
        2 => (prop::collection::vec(0..40u8, 0..10), any::<bool>()).prop_map(|(ids, more)| Op::Page(ids, more)),
        1 => (0..40u8).prop_map(Op::Remove),
        1 => (0..1_000u64).prop_map(Op::Pending),
    ]
}

fn apply(store: &mut MessageStore, op: &Op) {
    match op {
        Op::Live(id) => {
            store.append(message(*id, stamp(*id)));
        }
        Op::Page(ids, more) => {
            let page = ids.iter().map(|id| message(*id, stamp(*id))).collect();
            store.prepend_page(page, *more);
        }
        Op::Remove(id) => {
            store.remove(&MessageId::new(format!("m{id:03}")));
        }
        Op::Pending(offset) => {
            let mut pending = message(0, 1_700_000_000_000 + offset);
            pending.id = MessageId::local();
            store.append_pending(pending);
        }
    }
}

fn assert_invariants(store: &MessageStore) {
    let entries = store.ordered();
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        assert!(seen.insert(entry.message.id.clone()), "duplicate id {}", entry.message.id);
    }
    for pair in entries.windows(2) {
        assert!(
            pair[0].message.order_key() < pair[1].message.order_key(),
            "out of order: {} then {}",
            pair[0].message.id,
            pair[1].message.id
        );
    }
    assert_eq!(store.len(), entries.len());
}

proptest! {
    #[test]
    fn any_operation_sequence_keeps_invariants(ops in prop::collection::vec(arb_op(), 0..60)) {
        let mut store = MessageStore::new();
        for op in &ops {
            apply(&mut store, op);
            assert_invariants(&store);
        }
    }

    #[test]
    fn arrival_order_does_not_change_the_result(
        ids in prop::collection::vec(0..40u8, 0..30),
        seed in any::<u64>(),
    ) {
        let mut forward = MessageStore::new();
        for id in &ids {
            forward.append(message(*id, stamp(*id)));
        }

        // Deterministic shuffle driven by the seed.
        let mut shuffled = ids.clone();
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = usize::try_from(state % (i as u64 + 1)).unwrap();
            shuffled.swap(i, j);
        }
        let mut backward = MessageStore::new();
        for id in &shuffled {
            backward.append(message(*id, stamp(*id)));
        }

        let a: Vec<_> = forward.ordered().iter().map(|e| e.message.id.clone()).collect();
        let b: Vec<_> = backward.ordered().iter().map(|e| e.message.id.clone()).collect();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn replaying_a_page_inserts_nothing(ids in prop::collection::vec(0..40u8, 1..20)) {
        let mut store = MessageStore::new();
        let page: Vec<_> = ids.iter().map(|id| message(*id, stamp(*id))).collect();
        store.prepend_page(page.clone(), true);
        let before = store.len();

        prop_assert_eq!(store.prepend_page(page.clone(), false), 0);
        for m in page {
            prop_assert!(!store.append(m));
        }
        prop_assert_eq!(store.len(), before);
        prop_assert!(!store.has_more());
    }
}
