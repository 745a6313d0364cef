use std::collections::HashMap;

use shared::{
    domain::Topic,
    protocol::{
        ChangeNotification, ChangeOp, ChangePayload, MembershipChange, MessageChange,
        ReactionChange,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    cache::InsertOutcome,
    events::SyncEvent,
    pending::{EchoMatch, MutationResolution},
    store::{SharedStore, SyncStore},
};

const TOPIC_QUEUE_CAPACITY: usize = 1024;

/// What a single merge did to the store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub changed: bool,
    pub resolutions: Vec<MutationResolution>,
}

impl MergeReport {
    fn changed() -> Self {
        Self {
            changed: true,
            resolutions: Vec::new(),
        }
    }

    fn from_echo(echo: EchoMatch) -> Self {
        match echo {
            EchoMatch::Unmatched => Self::default(),
            EchoMatch::Matched(resolution) => Self {
                changed: true,
                resolutions: resolution.into_iter().collect(),
            },
        }
    }
}

/// Applies one change notification to the store. Safe to call any number of times with the
/// same notification.
pub fn merge(store: &mut SyncStore, topic: &Topic, notification: &ChangeNotification) -> MergeReport {
    match &notification.payload {
        ChangePayload::Message(change) => merge_message(store, topic, notification.op, change),
        ChangePayload::Reaction(change) => merge_reaction(store, topic, notification.op, change),
        ChangePayload::Membership(change) => merge_membership(store, notification.op, change),
    }
}

fn merge_message(
    store: &mut SyncStore,
    topic: &Topic,
    op: ChangeOp,
    change: &MessageChange,
) -> MergeReport {
    let SyncStore { cache, pending } = store;
    match op {
        ChangeOp::Insert => {
            let Some(message) = change.to_message() else {
                warn!(topic = %topic, id = ?change.id, "merge: dropping message insert with missing columns");
                return MergeReport::default();
            };
            if cache.contains_message(&message.id) {
                // A sweep may have cached the committed send before its echo arrived.
                if let Some(client_ref) = change.client_ref.as_deref() {
                    let echo = pending.absorb_duplicate_echo(cache, &message, client_ref);
                    if echo != EchoMatch::Unmatched {
                        return MergeReport::from_echo(echo);
                    }
                }
                // Duplicate delivery, possibly via a second topic.
                return match cache.insert_message(message) {
                    Ok(_) => MergeReport::default(),
                    Err(err) => {
                        warn!(topic = %topic, error = %err, "merge: ignoring conflicting message insert");
                        MergeReport::default()
                    }
                };
            }
            let echo = pending.absorb_message_echo(cache, &message, change.client_ref.as_deref());
            if echo != EchoMatch::Unmatched {
                return MergeReport::from_echo(echo);
            }
            match cache.insert_message(message) {
                Ok(InsertOutcome::Inserted) => MergeReport::changed(),
                Ok(InsertOutcome::Duplicate) => MergeReport::default(),
                Err(err) => {
                    warn!(topic = %topic, error = %err, "merge: ignoring conflicting message insert");
                    MergeReport::default()
                }
            }
        }
        ChangeOp::Update => {
            if !cache.update_message(change) {
                debug!(topic = %topic, id = ?change.id, "merge: message update had no effect");
                return MergeReport::default();
            }
            MergeReport::changed()
        }
        ChangeOp::Delete => {
            let Some(id) = change.id.as_ref() else {
                warn!(topic = %topic, "merge: dropping message delete without id");
                return MergeReport::default();
            };
            MergeReport {
                changed: cache.remove_message(id).is_some(),
                resolutions: Vec::new(),
            }
        }
    }
}

fn merge_reaction(
    store: &mut SyncStore,
    topic: &Topic,
    op: ChangeOp,
    change: &ReactionChange,
) -> MergeReport {
    let SyncStore { cache, pending } = store;
    match op {
        ChangeOp::Insert | ChangeOp::Update => {
            let Some(reaction) = change.to_reaction() else {
                warn!(topic = %topic, id = ?change.id, "merge: dropping reaction with missing columns");
                return MergeReport::default();
            };
            if cache.reaction(&reaction.id).is_some() {
                return MergeReport::default();
            }
            let echo = pending.absorb_reaction_echo(cache, &reaction);
            if echo != EchoMatch::Unmatched {
                return MergeReport::from_echo(echo);
            }
            if pending.hides_reaction(&reaction.key()) {
                debug!(topic = %topic, id = %reaction.id, "merge: reaction is hidden by a pending removal");
                return MergeReport::default();
            }
            MergeReport {
                changed: cache.insert_reaction(reaction) == InsertOutcome::Inserted,
                resolutions: Vec::new(),
            }
        }
        ChangeOp::Delete => {
            let key = change.key();
            let removed = change
                .id
                .as_ref()
                .and_then(|id| cache.remove_reaction(id))
                .or_else(|| key.as_ref().and_then(|key| cache.remove_reaction_by_key(key)));
            let echo = pending.absorb_reaction_removal(change.id.as_ref(), key.as_ref());
            if removed.is_none() && echo == EchoMatch::Unmatched {
                debug!(topic = %topic, id = ?change.id, "merge: reaction delete matched nothing");
            }
            let mut report = MergeReport::from_echo(echo);
            report.changed |= removed.is_some();
            report
        }
    }
}

fn merge_membership(store: &mut SyncStore, op: ChangeOp, change: &MembershipChange) -> MergeReport {
    let changed = match op {
        ChangeOp::Insert | ChangeOp::Update => store.cache.upsert_membership(change),
        ChangeOp::Delete => store
            .cache
            .remove_membership(&change.scope, &change.user_id)
            .is_some(),
    };
    MergeReport {
        changed,
        resolutions: Vec::new(),
    }
}

enum QueueItem {
    Change(ChangeNotification),
    Flush(oneshot::Sender<()>),
}

struct TopicQueue {
    tx: mpsc::Sender<QueueItem>,
    worker: JoinHandle<()>,
}

/// Serializes merges per topic: each topic gets a single-consumer queue and its own worker,
/// so distinct topics merge concurrently.
pub struct EventReconciler {
    store: SharedStore,
    events: broadcast::Sender<SyncEvent>,
    queues: Mutex<HashMap<Topic, TopicQueue>>,
}

impl EventReconciler {
    pub fn new(store: SharedStore, events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            store,
            events,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queues `notification` behind everything already received on `topic`.
    pub async fn on_event(&self, topic: &Topic, notification: ChangeNotification) {
        let tx = self.sender(topic).await;
        if tx.send(QueueItem::Change(notification)).await.is_err() {
            warn!(topic = %topic, "reconciler: queue closed, dropping notification");
        }
    }

    /// Resolves once every notification queued on `topic` so far has been merged.
    pub async fn flush(&self, topic: &Topic) {
        let tx = {
            let queues = self.queues.lock().await;
            match queues.get(topic) {
                Some(queue) => queue.tx.clone(),
                None => return,
            }
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(QueueItem::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Stops the topic's worker; notifications still queued are discarded.
    pub async fn close_topic(&self, topic: &Topic) {
        if let Some(queue) = self.queues.lock().await.remove(topic) {
            queue.worker.abort();
        }
    }

    pub async fn shutdown(&self) {
        let mut queues = self.queues.lock().await;
        for (_, queue) in queues.drain() {
            queue.worker.abort();
        }
    }

    async fn sender(&self, topic: &Topic) -> mpsc::Sender<QueueItem> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(topic) {
            if !queue.worker.is_finished() {
                return queue.tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(TOPIC_QUEUE_CAPACITY);
        let worker = self.spawn_worker(topic.clone(), rx);
        queues.insert(
            topic.clone(),
            TopicQueue {
                tx: tx.clone(),
                worker,
            },
        );
        tx
    }

    fn spawn_worker(&self, topic: Topic, mut rx: mpsc::Receiver<QueueItem>) -> JoinHandle<()> {
        let store = self.store.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let notification = match item {
                    QueueItem::Change(notification) => notification,
                    QueueItem::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let report = {
                    let mut store = store.write().await;
                    merge(&mut store, &topic, &notification)
                };
                if report.changed {
                    let _ = events.send(SyncEvent::CacheChanged {
                        topic: topic.clone(),
                    });
                }
                for resolution in report.resolutions {
                    let _ = events.send(SyncEvent::MutationResolved(resolution));
                }
            }
            debug!(topic = %topic, "reconciler: worker stopped");
        })
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
