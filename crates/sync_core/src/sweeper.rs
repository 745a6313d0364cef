use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use shared::domain::{MessageId, ReactionId, Topic};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    api::FetchApi,
    cache::{EntityCache, SweepDiff, SweepGuard},
    error::{SyncError, SyncResult},
    events::SyncEvent,
    pending::MutationResolution,
    store::{SharedStore, SyncStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTrigger {
    /// The topic reached `connected`; bypasses the interval throttle.
    Connected,
    Interval,
    Manual,
}

#[derive(Default)]
struct SweepSlot {
    eligible: bool,
    in_flight: bool,
    last_started: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
    running: Option<JoinHandle<()>>,
}

/// Periodic full-refetch backstop for events the push channels missed.
pub struct ReconciliationSweeper {
    store: SharedStore,
    fetch: Arc<dyn FetchApi>,
    events: broadcast::Sender<SyncEvent>,
    interval: Duration,
    fetch_limit: u32,
    slots: Mutex<HashMap<Topic, SweepSlot>>,
}

impl ReconciliationSweeper {
    pub fn new(
        store: SharedStore,
        fetch: Arc<dyn FetchApi>,
        events: broadcast::Sender<SyncEvent>,
        interval: Duration,
        fetch_limit: u32,
    ) -> Self {
        Self {
            store,
            fetch,
            events,
            interval,
            fetch_limit: fetch_limit.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches the authoritative view of `topic` and corrects the cache against it.
    pub async fn sweep(&self, topic: &Topic) -> SyncResult<SweepDiff> {
        match topic.thread_parent() {
            Some(parent_id) => self.sweep_thread(topic, parent_id).await,
            None => self.sweep_top_level(topic).await,
        }
    }

    async fn sweep_top_level(&self, topic: &Topic) -> SyncResult<SweepDiff> {
        let Some(scope) = topic.scope() else {
            return Ok(SweepDiff::default());
        };
        let (known_messages, known_reactions) = {
            let store = self.store.read().await;
            snapshot(&store, store.cache.top_level_ids(&scope))
        };
        let fetched = self
            .fetch
            .fetch_top_level_messages(&scope, self.fetch_limit)
            .await
            .map_err(|source| sweep_fetch(topic, source))?;
        let window_complete = fetched.len() < self.fetch_limit as usize;
        let ids = union_ids(&known_messages, fetched.iter().map(|m| m.id.clone()));
        let reactions = self
            .fetch
            .fetch_reactions(&ids)
            .await
            .map_err(|source| sweep_fetch(topic, source))?;

        let mut store = self.store.write().await;
        let SyncStore { cache, pending } = &mut *store;
        let (confirmed, resolutions) = pending.absorb_fetched(cache, &fetched);
        let mut guard = pending.sweep_guard();
        let current = cache.top_level_ids(&scope);
        guard_concurrent_changes(cache, current, &known_messages, &ids, &known_reactions, &mut guard);

        let mut diff = cache.reconcile_top_level(&scope, fetched, window_complete, &guard);
        cache.reconcile_reactions(&ids, reactions, &guard, &mut diff);
        diff.confirmed = confirmed;
        drop(store);
        self.emit_resolutions(resolutions);
        Ok(diff)
    }

    async fn sweep_thread(&self, topic: &Topic, parent_id: &MessageId) -> SyncResult<SweepDiff> {
        let (known_messages, known_reactions) = {
            let store = self.store.read().await;
            snapshot(&store, store.cache.thread_ids(parent_id))
        };
        let fetched = self
            .fetch
            .fetch_thread_children(parent_id)
            .await
            .map_err(|source| sweep_fetch(topic, source))?;
        let ids = union_ids(&known_messages, fetched.iter().map(|m| m.id.clone()));
        let reactions = self
            .fetch
            .fetch_reactions(&ids)
            .await
            .map_err(|source| sweep_fetch(topic, source))?;

        let mut store = self.store.write().await;
        let SyncStore { cache, pending } = &mut *store;
        let (confirmed, resolutions) = pending.absorb_fetched(cache, &fetched);
        let mut guard = pending.sweep_guard();
        let current = cache.thread_ids(parent_id);
        guard_concurrent_changes(cache, current, &known_messages, &ids, &known_reactions, &mut guard);

        let mut diff = cache.reconcile_thread(parent_id, fetched, &guard);
        cache.reconcile_reactions(&ids, reactions, &guard, &mut diff);
        diff.confirmed = confirmed;
        drop(store);
        self.emit_resolutions(resolutions);
        Ok(diff)
    }

    fn emit_resolutions(&self, resolutions: Vec<MutationResolution>) {
        for resolution in resolutions {
            let _ = self.events.send(SyncEvent::MutationResolved(resolution));
        }
    }

    /// Registers `topic` and starts its interval ticker. Idempotent.
    pub async fn start(self: &Arc<Self>, topic: &Topic) {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(topic) {
            return;
        }
        let sweeper = Arc::clone(self);
        let ticking = topic.clone();
        let interval = self.interval;
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                sweeper.request_sweep(&ticking, SweepTrigger::Interval).await;
            }
        });
        slots.insert(
            topic.clone(),
            SweepSlot {
                ticker: Some(ticker),
                ..SweepSlot::default()
            },
        );
        debug!(topic = %topic, "sweeper: started");
    }

    /// Cancels the ticker and any sweep in flight for `topic`.
    pub async fn stop(&self, topic: &Topic) {
        if let Some(slot) = self.slots.lock().await.remove(topic) {
            abort_slot(slot);
            debug!(topic = %topic, "sweeper: stopped");
        }
    }

    pub async fn stop_all(&self) {
        let mut slots = self.slots.lock().await;
        for (_, slot) in slots.drain() {
            abort_slot(slot);
        }
    }

    /// Interval sweeps only run while the topic is connected or has given up reconnecting.
    pub async fn set_eligible(&self, topic: &Topic, eligible: bool) {
        if let Some(slot) = self.slots.lock().await.get_mut(topic) {
            slot.eligible = eligible;
        }
    }

    /// Starts a background sweep unless one is in flight or throttled. Returns whether it ran.
    pub async fn request_sweep(self: &Arc<Self>, topic: &Topic, trigger: SweepTrigger) -> bool {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(topic) else {
            return false;
        };
        if slot.in_flight {
            debug!(topic = %topic, trigger = ?trigger, "sweeper: sweep in flight, dropping request");
            return false;
        }
        if trigger == SweepTrigger::Interval {
            if !slot.eligible {
                return false;
            }
            let throttled = slot
                .last_started
                .is_some_and(|started| started.elapsed() < self.interval);
            if throttled {
                return false;
            }
        }
        slot.in_flight = true;
        slot.last_started = Some(Instant::now());

        let sweeper = Arc::clone(self);
        let sweeping = topic.clone();
        slot.running = Some(tokio::spawn(async move {
            let result = sweeper.sweep(&sweeping).await;
            sweeper.finish(&sweeping, result).await;
        }));
        true
    }

    async fn finish(&self, topic: &Topic, result: SyncResult<SweepDiff>) {
        if let Some(slot) = self.slots.lock().await.get_mut(topic) {
            slot.in_flight = false;
            slot.running = None;
        }
        match result {
            Ok(diff) => {
                if diff.is_noop() {
                    debug!(topic = %topic, refreshed = diff.refreshed, "sweeper: cache already consistent");
                } else {
                    info!(
                        topic = %topic,
                        inserted = diff.inserted.len(),
                        removed = diff.removed.len(),
                        reactions_inserted = diff.reactions_inserted,
                        reactions_removed = diff.reactions_removed,
                        confirmed = diff.confirmed,
                        "sweeper: corrected cache"
                    );
                    let _ = self.events.send(SyncEvent::CacheChanged {
                        topic: topic.clone(),
                    });
                }
                let _ = self.events.send(SyncEvent::SweepCompleted {
                    topic: topic.clone(),
                    diff,
                });
            }
            Err(err) => {
                warn!(topic = %topic, error = %err, "sweeper: sweep failed, retrying next interval");
                let _ = self.events.send(SyncEvent::SweepFailed {
                    topic: topic.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
}

fn abort_slot(slot: SweepSlot) {
    if let Some(ticker) = slot.ticker {
        ticker.abort();
    }
    if let Some(running) = slot.running {
        running.abort();
    }
}

fn sweep_fetch(topic: &Topic, source: anyhow::Error) -> SyncError {
    SyncError::SweepFetch {
        topic: topic.clone(),
        source,
    }
}

fn snapshot(store: &SyncStore, message_ids: Vec<MessageId>) -> (Vec<MessageId>, HashSet<ReactionId>) {
    let reactions = message_ids
        .iter()
        .flat_map(|id| store.cache.reaction_list(id))
        .map(|reaction| reaction.id)
        .collect();
    (message_ids, reactions)
}

fn union_ids(known: &[MessageId], fetched: impl Iterator<Item = MessageId>) -> Vec<MessageId> {
    let mut ids: Vec<MessageId> = known.to_vec();
    let mut seen: HashSet<MessageId> = ids.iter().cloned().collect();
    for id in fetched {
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    ids
}

/// Pushes that landed while the fetch was in flight are newer than the fetch: inserts must
/// survive it and deletes must not be undone by it.
fn guard_concurrent_changes(
    cache: &EntityCache,
    current: Vec<MessageId>,
    known_messages: &[MessageId],
    message_ids: &[MessageId],
    known_reactions: &HashSet<ReactionId>,
    guard: &mut SweepGuard,
) {
    let known: HashSet<&MessageId> = known_messages.iter().collect();
    let current: HashSet<MessageId> = current.into_iter().collect();
    guard.deleted_messages.extend(
        known_messages
            .iter()
            .filter(|id| !current.contains(*id))
            .cloned(),
    );
    guard
        .messages
        .extend(current.into_iter().filter(|id| !known.contains(id)));

    for message_id in message_ids {
        for reaction in cache.reaction_list(message_id) {
            if !known_reactions.contains(&reaction.id) {
                guard.reactions.insert(reaction.id);
            }
        }
    }
    guard.deleted_reactions.extend(
        known_reactions
            .iter()
            .filter(|id| cache.reaction(id).is_none())
            .cloned(),
    );
}

#[cfg(test)]
#[path = "tests/sweeper_tests.rs"]
mod tests;
