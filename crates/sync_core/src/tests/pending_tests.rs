use super::*;
use crate::fixtures::{channel, message, reaction, ts, ME};

fn tracker() -> PendingMutationTracker {
    PendingMutationTracker::new(UserId::from(ME), Duration::from_secs(10))
}

fn add_thumbs_up() -> MutationRequest {
    MutationRequest::AddReaction {
        message_id: "m1".into(),
        emoji: "👍".into(),
    }
}

fn seeded_cache() -> EntityCache {
    let mut cache = EntityCache::new();
    cache
        .insert_message(message("m1", &channel("ch1"), 1))
        .expect("m1");
    cache.insert_reaction(reaction("x1", "m1", "u2", "👍"));
    cache
}

#[test]
fn failed_reaction_restores_previous_view() {
    let mut cache = seeded_cache();
    let mut tracker = tracker();
    let before = cache.reactions(&"m1".into());

    let local_id = tracker
        .begin(&mut cache, add_thumbs_up(), ts(100))
        .expect("begin");
    assert_eq!(cache.reactions(&"m1".into())[0].count, 2);

    let resolution = tracker
        .resolve(
            &mut cache,
            &local_id,
            MutationOutcome::Failed {
                reason: "offline".into(),
            },
        )
        .expect("resolve")
        .expect("settled");
    assert!(!resolution.outcome.is_success());
    assert!(matches!(
        resolution.into_result(),
        Err(SyncError::MutationRejected { .. })
    ));
    assert_eq!(cache.reactions(&"m1".into()), before);
    assert_eq!(tracker.status(&local_id), Some(MutationStatus::Failed));
}

#[test]
fn second_toggle_on_same_triple_conflicts() {
    let mut cache = seeded_cache();
    let mut tracker = tracker();

    tracker
        .begin(&mut cache, add_thumbs_up(), ts(100))
        .expect("first");
    let err = tracker
        .begin(&mut cache, add_thumbs_up(), ts(101))
        .expect_err("second");
    assert!(matches!(err, SyncError::Conflict { .. }));

    let mine: Vec<_> = cache
        .reaction_list(&"m1".into())
        .into_iter()
        .filter(|r| r.user_id.as_str() == ME && r.emoji == "👍")
        .collect();
    assert_eq!(mine.len(), 1);
    assert!(mine[0].id.is_temporary());

    let remove = MutationRequest::RemoveReaction {
        message_id: "m1".into(),
        emoji: "👍".into(),
    };
    assert!(matches!(
        tracker.begin(&mut cache, remove, ts(102)),
        Err(SyncError::Conflict { .. })
    ));
}

#[test]
fn reaction_echo_swaps_placeholder_id() {
    let mut cache = seeded_cache();
    let mut tracker = tracker();
    let local_id = tracker
        .begin(&mut cache, add_thumbs_up(), ts(100))
        .expect("begin");

    let server = reaction("srv-r1", "m1", ME, "👍");
    let matched = tracker.absorb_reaction_echo(&mut cache, &server);
    let EchoMatch::Matched(Some(resolution)) = matched else {
        panic!("expected a settling match, got {matched:?}");
    };
    assert_eq!(resolution.local_id, local_id);
    assert!(cache.reaction(&"srv-r1".into()).is_some());
    assert_eq!(cache.reactions(&"m1".into())[0].count, 2);

    // backend answer arriving second is a no-op
    let late = tracker
        .resolve(
            &mut cache,
            &local_id,
            MutationOutcome::Confirmed {
                server_id: Some("srv-r1".into()),
            },
        )
        .expect("late resolve");
    assert!(late.is_none());
    assert_eq!(cache.reaction_list(&"m1".into()).len(), 2);
}

#[test]
fn send_echo_replaces_temporary_message() {
    let mut cache = EntityCache::new();
    let mut tracker = tracker();
    let scope = channel("ch1");

    let local_id = tracker
        .begin(
            &mut cache,
            MutationRequest::SendMessage {
                scope: scope.clone(),
                parent_id: None,
                content: "hi".into(),
            },
            ts(100),
        )
        .expect("begin");
    let optimistic = cache.top_level(&scope);
    assert_eq!(optimistic.len(), 1);
    assert!(optimistic[0].id.is_temporary());
    assert_eq!(optimistic[0].content, "hi");

    let mut echo = message("srv-1", &scope, 101);
    echo.sender_id = UserId::from(ME);
    echo.content = "hi".into();
    let matched = tracker.absorb_message_echo(&mut cache, &echo, None);
    assert!(matches!(matched, EchoMatch::Matched(Some(_))));

    let settled = cache.top_level(&scope);
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].id, MessageId::from("srv-1"));
    assert_eq!(tracker.status(&local_id), Some(MutationStatus::Confirmed));
    assert_eq!(tracker.pending_count(), 0);
}

#[test]
fn confirmed_without_id_still_absorbs_the_echo() {
    let mut cache = EntityCache::new();
    let mut tracker = tracker();
    let scope = channel("ch1");
    let local_id = tracker
        .begin(
            &mut cache,
            MutationRequest::SendMessage {
                scope: scope.clone(),
                parent_id: None,
                content: "hello".into(),
            },
            ts(100),
        )
        .expect("begin");

    let resolution = tracker
        .resolve(
            &mut cache,
            &local_id,
            MutationOutcome::Confirmed { server_id: None },
        )
        .expect("resolve");
    assert!(resolution.is_some());
    assert_eq!(tracker.get(&local_id).map(|e| e.status), Some(MutationStatus::Confirmed));

    let mut echo = message("srv-7", &scope, 100);
    echo.sender_id = UserId::from(ME);
    echo.content = "hello".into();
    let matched = tracker.absorb_message_echo(&mut cache, &echo, Some(&local_id.to_string()));
    assert_eq!(matched, EchoMatch::Matched(None));
    assert_eq!(cache.top_level_ids(&scope), vec![MessageId::from("srv-7")]);
}

#[test]
fn optimistic_reply_counts_immediately_and_rolls_back() {
    let mut cache = EntityCache::new();
    let mut tracker = tracker();
    let scope = channel("ch1");
    let mut parent = message("p1", &scope, 1);
    parent.reply_count = 2;
    cache.insert_message(parent).expect("p1");

    let reply = MutationRequest::SendMessage {
        scope: scope.clone(),
        parent_id: Some("p1".into()),
        content: "reply".into(),
    };
    let failing = tracker
        .begin(&mut cache, reply.clone(), ts(100))
        .expect("begin");
    assert_eq!(cache.message(&"p1".into()).expect("p1").reply_count, 3);
    assert!(cache.top_level(&scope).iter().all(|m| m.id.as_str() == "p1"));

    tracker
        .resolve(
            &mut cache,
            &failing,
            MutationOutcome::Failed {
                reason: "denied".into(),
            },
        )
        .expect("resolve");
    assert_eq!(cache.message(&"p1".into()).expect("p1").reply_count, 2);
    assert!(cache.thread(&"p1".into()).is_empty());

    let confirmed = tracker.begin(&mut cache, reply, ts(110)).expect("begin");
    tracker
        .resolve(
            &mut cache,
            &confirmed,
            MutationOutcome::Confirmed {
                server_id: Some("srv-r".into()),
            },
        )
        .expect("resolve");
    assert_eq!(cache.message(&"p1".into()).expect("p1").reply_count, 3);
    assert_eq!(cache.thread_ids(&"p1".into()), vec![MessageId::from("srv-r")]);
}

#[test]
fn removal_hides_then_restores_on_failure() {
    let mut cache = seeded_cache();
    cache.insert_reaction(reaction("srv-mine", "m1", ME, "🎉"));
    let mut tracker = tracker();
    let before = cache.reactions(&"m1".into());

    let local_id = tracker
        .begin(
            &mut cache,
            MutationRequest::RemoveReaction {
                message_id: "m1".into(),
                emoji: "🎉".into(),
            },
            ts(100),
        )
        .expect("begin");
    assert_eq!(
        tracker
            .get(&local_id)
            .and_then(|entry| entry.hidden_reaction())
            .map(|r| r.id.as_str()),
        Some("srv-mine")
    );
    assert!(cache.reaction(&"srv-mine".into()).is_none());
    assert!(tracker
        .sweep_guard()
        .hidden_reactions
        .iter()
        .any(|key| key.emoji == "🎉"));

    tracker
        .resolve(
            &mut cache,
            &local_id,
            MutationOutcome::Failed {
                reason: "nope".into(),
            },
        )
        .expect("resolve");
    assert_eq!(cache.reactions(&"m1".into()), before);
}

#[test]
fn removing_a_missing_reaction_is_invalid() {
    let mut cache = seeded_cache();
    let mut tracker = tracker();
    let err = tracker
        .begin(
            &mut cache,
            MutationRequest::RemoveReaction {
                message_id: "m1".into(),
                emoji: "🙃".into(),
            },
            ts(100),
        )
        .expect_err("nothing to remove");
    assert!(matches!(err, SyncError::InvalidTarget(_)));
}

#[test]
fn overdue_mutations_time_out() {
    let mut cache = seeded_cache();
    let mut tracker = tracker();
    let local_id = tracker
        .begin(&mut cache, add_thumbs_up(), ts(100))
        .expect("begin");

    assert!(tracker.expire(&mut cache, ts(105)).is_empty());
    let expired = tracker.expire(&mut cache, ts(110));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].outcome, MutationOutcome::TimedOut);
    assert!(matches!(
        expired[0].clone().into_result(),
        Err(SyncError::MutationTimeout { .. })
    ));
    assert_eq!(cache.reaction_list(&"m1".into()).len(), 1);
    assert_eq!(tracker.status(&local_id), Some(MutationStatus::Failed));
}

#[tokio::test]
async fn on_resolved_fires_for_pending_and_settled_mutations() {
    let mut cache = seeded_cache();
    let mut tracker = tracker();
    let local_id = tracker
        .begin(&mut cache, add_thumbs_up(), ts(100))
        .expect("begin");

    let early = tracker.on_resolved(&local_id).expect("waiter");
    tracker
        .resolve(
            &mut cache,
            &local_id,
            MutationOutcome::Confirmed {
                server_id: Some("srv-x".into()),
            },
        )
        .expect("resolve");
    let late = tracker.on_resolved(&local_id).expect("history");

    assert!(early.await.expect("early").outcome.is_success());
    assert!(late.await.expect("late").outcome.is_success());
    assert!(cache.reaction(&"srv-x".into()).is_some());

    assert!(matches!(
        tracker.on_resolved(&LocalId::new()),
        Err(SyncError::UnknownMutation(_))
    ));
}

#[test]
fn cannot_target_unconfirmed_messages() {
    let mut cache = EntityCache::new();
    let mut tracker = tracker();
    let err = tracker
        .begin(
            &mut cache,
            MutationRequest::AddReaction {
                message_id: "tmp-abc".into(),
                emoji: "👍".into(),
            },
            ts(1),
        )
        .expect_err("temporary target");
    assert!(matches!(err, SyncError::InvalidTarget(_)));

    let err = tracker
        .begin(
            &mut cache,
            MutationRequest::SendMessage {
                scope: channel("ch1"),
                parent_id: None,
                content: "   ".into(),
            },
            ts(1),
        )
        .expect_err("empty content");
    assert!(matches!(err, SyncError::InvalidTarget(_)));
}
