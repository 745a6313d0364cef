use shared::domain::ChannelId;

use super::*;
use crate::{clock::ManualClock, fixtures::ts};

fn setup() -> (EphemeralSignalStore, ManualClock) {
    let clock = ManualClock::new(ts(0));
    (EphemeralSignalStore::new(Arc::new(clock.clone())), clock)
}

fn topic(id: &str) -> Topic {
    Topic::Channel(ChannelId::from(id))
}

#[tokio::test]
async fn signals_expire_unless_refreshed() {
    let (store, clock) = setup();
    let ttl = Duration::from_secs(5);
    store.set_signal(&topic("ch1"), &"alice".into(), ttl).await;
    store.set_signal(&topic("ch1"), &"bob".into(), ttl).await;

    clock.advance(Duration::from_secs(3));
    store.set_signal(&topic("ch1"), &"bob".into(), ttl).await;
    clock.advance(Duration::from_secs(3));

    let active = store.get_active(&topic("ch1")).await;
    assert_eq!(active.into_iter().collect::<Vec<_>>(), vec![UserId::from("bob")]);

    clock.advance(Duration::from_secs(3));
    assert!(store.get_active(&topic("ch1")).await.is_empty());
}

#[tokio::test]
async fn topics_are_independent() {
    let (store, _clock) = setup();
    let ttl = Duration::from_secs(5);
    store.set_signal(&topic("ch1"), &"alice".into(), ttl).await;
    store.set_signal(&topic("ch2"), &"carol".into(), ttl).await;

    store.clear_topic(&topic("ch1")).await;
    assert!(store.get_active(&topic("ch1")).await.is_empty());
    assert_eq!(store.get_active(&topic("ch2")).await.len(), 1);

    assert!(store.clear_signal(&topic("ch2"), &"carol".into()).await);
    assert!(!store.clear_signal(&topic("ch2"), &"carol".into()).await);
}

#[tokio::test]
async fn purge_drops_only_expired_entries() {
    let (store, clock) = setup();
    store
        .set_signal(&topic("ch1"), &"alice".into(), Duration::from_secs(1))
        .await;
    store
        .set_signal(&topic("ch1"), &"bob".into(), Duration::from_secs(10))
        .await;
    store
        .set_signal(&topic("ch2"), &"carol".into(), Duration::from_secs(1))
        .await;

    clock.advance(Duration::from_secs(2));
    assert_eq!(store.purge_expired().await, 2);
    assert_eq!(store.purge_expired().await, 0);
    assert_eq!(store.get_active(&topic("ch1")).await.len(), 1);
}
