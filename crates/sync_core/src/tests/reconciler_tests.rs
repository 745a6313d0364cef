use std::time::Duration;

use shared::{
    domain::{MessageId, Scope, UserId},
    protocol::ChangeOp,
};

use super::*;
use crate::{
    fixtures::{
        channel, message, message_insert, reaction, reaction_delete, reaction_insert, reply, ts,
        ME,
    },
    pending::{MutationKind, MutationRequest},
};

fn store() -> SyncStore {
    SyncStore::new(UserId::from(ME), Duration::from_secs(10))
}

fn channel_topic() -> Topic {
    Topic::for_scope(&channel("ch1"))
}

#[test]
fn repeated_insert_is_idempotent() {
    let mut store = store();
    let scope = channel("ch1");
    let insert = message_insert(&message("m1", &scope, 1));

    assert!(merge(&mut store, &channel_topic(), &insert).changed);
    for _ in 0..3 {
        assert_eq!(merge(&mut store, &channel_topic(), &insert), MergeReport::default());
    }
    assert_eq!(store.cache.message_count(), 1);
    assert_eq!(store.cache.top_level(&scope).len(), 1);
}

#[test]
fn reply_seen_on_channel_and_thread_counts_once() {
    let mut store = store();
    let scope = channel("ch1");
    merge(&mut store, &channel_topic(), &message_insert(&message("p1", &scope, 1)));

    let child = message_insert(&reply("r1", "p1", &scope, 2));
    merge(&mut store, &channel_topic(), &child);
    merge(&mut store, &Topic::Thread("p1".into()), &child);

    let parent = store.cache.message(&"p1".into()).expect("p1");
    assert_eq!(parent.reply_count, 1);
    assert_eq!(store.cache.thread_ids(&"p1".into()), vec![MessageId::from("r1")]);
    assert_eq!(store.cache.top_level_ids(&scope), vec![MessageId::from("p1")]);
}

#[test]
fn reaction_delete_without_id_falls_back_to_triple() {
    let mut store = store();
    let scope = channel("ch1");
    merge(&mut store, &channel_topic(), &message_insert(&message("m1", &scope, 1)));
    merge(&mut store, &channel_topic(), &reaction_insert(&reaction("x1", "m1", "u2", "👍")));

    let delete = reaction_delete(ReactionChange {
        message_id: Some("m1".into()),
        user_id: Some("u2".into()),
        emoji: Some("👍".into()),
        ..ReactionChange::default()
    });
    assert!(merge(&mut store, &channel_topic(), &delete).changed);
    assert!(store.cache.reactions(&"m1".into()).is_empty());

    // nothing left to match: not an error
    assert!(!merge(&mut store, &channel_topic(), &delete).changed);
}

#[test]
fn send_echo_leaves_exactly_one_message() {
    let mut store = store();
    let scope = channel("ch1");
    let SyncStore { cache, pending } = &mut store;
    let local_id = pending
        .begin(
            cache,
            MutationRequest::SendMessage {
                scope: scope.clone(),
                parent_id: None,
                content: "hi".into(),
            },
            ts(10),
        )
        .expect("begin");

    let mut echo = message("srv-1", &scope, 11);
    echo.sender_id = UserId::from(ME);
    echo.content = "hi".into();
    let report = merge(&mut store, &channel_topic(), &message_insert(&echo));

    assert!(report.changed);
    assert_eq!(report.resolutions.len(), 1);
    assert_eq!(report.resolutions[0].local_id, local_id);
    assert_eq!(report.resolutions[0].kind, MutationKind::SendMessage);
    assert_eq!(store.cache.top_level_ids(&scope), vec![MessageId::from("srv-1")]);

    // the same echo again through another path changes nothing
    assert!(!merge(&mut store, &channel_topic(), &message_insert(&echo)).changed);
    assert_eq!(store.cache.message_count(), 1);
}

#[test]
fn echo_is_matched_by_client_reference_first() {
    let mut store = store();
    let scope = channel("ch1");
    let SyncStore { cache, pending } = &mut store;
    let first = pending
        .begin(
            cache,
            MutationRequest::SendMessage {
                scope: scope.clone(),
                parent_id: None,
                content: "same".into(),
            },
            ts(10),
        )
        .expect("first");
    let second = pending
        .begin(
            cache,
            MutationRequest::SendMessage {
                scope: scope.clone(),
                parent_id: None,
                content: "same".into(),
            },
            ts(11),
        )
        .expect("second");

    let mut echo = message("srv-2", &scope, 12);
    echo.sender_id = UserId::from(ME);
    echo.content = "same".into();
    let mut change = MessageChange::from_message(&echo);
    change.client_ref = Some(second.to_string());
    let report = merge(
        &mut store,
        &channel_topic(),
        &ChangeNotification::message(ChangeOp::Insert, change),
    );

    assert_eq!(report.resolutions[0].local_id, second);
    assert!(store.pending.get(&first).is_some());
    assert!(store.pending.get(&second).is_none());
    assert_eq!(store.cache.top_level(&scope).len(), 2);
}

#[test]
fn reaction_echo_confirms_optimistic_add() {
    let mut store = store();
    let scope = channel("ch1");
    merge(&mut store, &channel_topic(), &message_insert(&message("m1", &scope, 1)));
    let SyncStore { cache, pending } = &mut store;
    let local_id = pending
        .begin(
            cache,
            MutationRequest::AddReaction {
                message_id: "m1".into(),
                emoji: "👍".into(),
            },
            ts(10),
        )
        .expect("begin");

    let report = merge(
        &mut store,
        &channel_topic(),
        &reaction_insert(&reaction("srv-r", "m1", ME, "👍")),
    );
    assert_eq!(report.resolutions[0].local_id, local_id);
    let list = store.cache.reaction_list(&"m1".into());
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id.as_str(), "srv-r");
}

#[test]
fn reaction_delete_confirms_optimistic_removal() {
    let mut store = store();
    let scope = channel("ch1");
    merge(&mut store, &channel_topic(), &message_insert(&message("m1", &scope, 1)));
    merge(&mut store, &channel_topic(), &reaction_insert(&reaction("x9", "m1", ME, "🎉")));
    let SyncStore { cache, pending } = &mut store;
    let local_id = pending
        .begin(
            cache,
            MutationRequest::RemoveReaction {
                message_id: "m1".into(),
                emoji: "🎉".into(),
            },
            ts(10),
        )
        .expect("begin");

    let report = merge(
        &mut store,
        &channel_topic(),
        &reaction_delete(ReactionChange {
            id: Some("x9".into()),
            ..ReactionChange::default()
        }),
    );
    assert_eq!(report.resolutions.len(), 1);
    assert_eq!(report.resolutions[0].local_id, local_id);
    assert_eq!(store.pending.pending_count(), 0);
    assert!(store.cache.reaction_list(&"m1".into()).is_empty());
}

#[test]
fn echo_for_an_already_cached_send_drops_the_placeholder() {
    let mut store = store();
    let scope = channel("ch1");
    let SyncStore { cache, pending } = &mut store;
    let local_id = pending
        .begin(
            cache,
            MutationRequest::SendMessage {
                scope: scope.clone(),
                parent_id: None,
                content: "hi".into(),
            },
            ts(10),
        )
        .expect("begin");
    let mut committed = message("srv-1", &scope, 11);
    committed.sender_id = UserId::from(ME);
    committed.content = "hi".into();
    // a refetch cached the committed row next to the placeholder
    cache.insert_message(committed.clone()).expect("insert");
    assert_eq!(cache.top_level(&scope).len(), 2);

    let mut change = MessageChange::from_message(&committed);
    change.client_ref = Some(local_id.to_string());
    let report = merge(
        &mut store,
        &channel_topic(),
        &ChangeNotification::message(ChangeOp::Insert, change),
    );

    assert_eq!(report.resolutions.len(), 1);
    assert_eq!(report.resolutions[0].local_id, local_id);
    assert_eq!(
        store.cache.top_level_ids(&scope),
        vec![MessageId::from("srv-1")]
    );
    assert_eq!(store.pending.pending_count(), 0);
}

#[test]
fn redelivered_reaction_stays_hidden_while_its_removal_is_pending() {
    let mut store = store();
    let scope = channel("ch1");
    merge(&mut store, &channel_topic(), &message_insert(&message("m1", &scope, 1)));
    let original = reaction("x9", "m1", ME, "🎉");
    merge(&mut store, &channel_topic(), &reaction_insert(&original));
    let SyncStore { cache, pending } = &mut store;
    pending
        .begin(
            cache,
            MutationRequest::RemoveReaction {
                message_id: "m1".into(),
                emoji: "🎉".into(),
            },
            ts(10),
        )
        .expect("begin");

    let report = merge(&mut store, &channel_topic(), &reaction_insert(&original));
    assert_eq!(report, MergeReport::default());
    assert!(store.cache.reaction_list(&"m1".into()).is_empty());
    assert_eq!(store.pending.pending_count(), 1);

    // someone else's reaction with the same emoji is not hidden
    let other = reaction("x10", "m1", "u2", "🎉");
    assert!(merge(&mut store, &channel_topic(), &reaction_insert(&other)).changed);
    assert_eq!(store.cache.reaction_list(&"m1".into()).len(), 1);
}

#[test]
fn malformed_insert_is_dropped() {
    let mut store = store();
    let change = MessageChange {
        id: Some("m1".into()),
        content: Some("no scope".into()),
        ..MessageChange::default()
    };
    let report = merge(
        &mut store,
        &channel_topic(),
        &ChangeNotification::message(ChangeOp::Insert, change),
    );
    assert_eq!(report, MergeReport::default());
    assert_eq!(store.cache.message_count(), 0);
}

#[test]
fn membership_changes_upsert_and_remove() {
    let mut store = store();
    let scope = channel("ch1");
    let change = MembershipChange {
        scope: scope.clone(),
        user_id: "u7".into(),
        display_name: Some("Seven".into()),
        last_read_at: None,
    };
    let insert = ChangeNotification::membership(ChangeOp::Insert, change.clone());
    assert!(merge(&mut store, &channel_topic(), &insert).changed);
    assert!(!merge(&mut store, &channel_topic(), &insert).changed);
    assert_eq!(store.cache.members(&scope).len(), 1);

    let delete = ChangeNotification::membership(ChangeOp::Delete, change);
    assert!(merge(&mut store, &channel_topic(), &delete).changed);
    assert!(store.cache.members(&Scope::Channel("ch1".into())).is_empty());
}

#[test]
fn replayed_sequence_converges_to_the_same_view() {
    let scope = channel("ch1");
    let sequence = vec![
        message_insert(&message("p1", &scope, 1)),
        message_insert(&reply("r1", "p1", &scope, 2)),
        reaction_insert(&reaction("x1", "p1", "u2", "👍")),
        message_insert(&reply("r2", "p1", &scope, 3)),
        ChangeNotification::message(
            ChangeOp::Delete,
            MessageChange {
                id: Some("r2".into()),
                ..MessageChange::default()
            },
        ),
    ];

    let mut once = store();
    for notification in &sequence {
        merge(&mut once, &channel_topic(), notification);
    }
    let mut twice = store();
    for notification in sequence.iter().chain(sequence.iter()) {
        merge(&mut twice, &channel_topic(), notification);
    }

    // the second pass re-inserts r2 as a fresh message, then deletes it again
    for store in [&once, &twice] {
        assert_eq!(store.cache.message(&"p1".into()).expect("p1").reply_count, 1);
        assert_eq!(store.cache.thread_ids(&"p1".into()), vec![MessageId::from("r1")]);
        assert_eq!(store.cache.reactions(&"p1".into())[0].count, 1);
    }
}

#[tokio::test]
async fn queued_events_merge_in_order_and_announce_changes() {
    let shared = store().shared();
    let (events, mut rx) = broadcast::channel(64);
    let reconciler = EventReconciler::new(shared.clone(), events);
    let scope = channel("ch1");
    let topic = channel_topic();

    reconciler
        .on_event(&topic, message_insert(&message("m1", &scope, 1)))
        .await;
    reconciler
        .on_event(
            &topic,
            ChangeNotification::message(
                ChangeOp::Update,
                MessageChange {
                    id: Some("m1".into()),
                    content: Some("edited".into()),
                    ..MessageChange::default()
                },
            ),
        )
        .await;
    reconciler
        .on_event(&topic, message_insert(&message("m1", &scope, 1)))
        .await;
    reconciler.flush(&topic).await;

    let store = shared.read().await;
    assert_eq!(store.cache.message(&"m1".into()).expect("m1").content, "edited");
    drop(store);

    let mut changed = 0;
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::CacheChanged { topic: changed_topic } = event {
            assert_eq!(changed_topic, topic);
            changed += 1;
        }
    }
    assert_eq!(changed, 2);
}

#[tokio::test]
async fn closing_a_topic_stops_its_worker_only() {
    let shared = store().shared();
    let (events, _rx) = broadcast::channel(64);
    let reconciler = EventReconciler::new(shared.clone(), events);
    let scope = channel("ch1");
    let thread = Topic::Thread("p1".into());

    reconciler
        .on_event(&channel_topic(), message_insert(&message("p1", &scope, 1)))
        .await;
    reconciler
        .on_event(&thread, message_insert(&reply("r1", "p1", &scope, 2)))
        .await;
    reconciler.flush(&channel_topic()).await;
    reconciler.flush(&thread).await;
    reconciler.close_topic(&channel_topic()).await;

    // a new event on a closed topic starts a fresh worker
    reconciler
        .on_event(&channel_topic(), message_insert(&message("p2", &scope, 3)))
        .await;
    reconciler.flush(&channel_topic()).await;

    let store = shared.read().await;
    assert_eq!(store.cache.top_level(&scope).len(), 2);
    assert_eq!(store.cache.message(&"p1".into()).expect("p1").reply_count, 1);
}
