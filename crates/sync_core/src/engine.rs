use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use futures::Stream;
use shared::{
    domain::{Membership, Message, MessageId, ReactionId, Scope, Topic, UserId},
    protocol::{ChangeNotification, MutationAck},
};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::{FetchApi, MutationApi, PushTransport},
    cache::{EntityCache, ReactionGroup, SweepDiff},
    clock::Clock,
    config::SyncSettings,
    error::{SyncError, SyncResult},
    events::SyncEvent,
    pending::{LocalId, MutationOutcome, MutationRequest, MutationResolution},
    reconciler::EventReconciler,
    signals::EphemeralSignalStore,
    store::{SharedStore, SyncStore},
    subscription::{
        ConnectionState, SubscriptionHandle, TopicListener, TopicStatus, TopicSubscriptionManager,
    },
    sweeper::{ReconciliationSweeper, SweepTrigger},
};

/// The collaborators an engine talks to.
#[derive(Clone)]
pub struct SyncBackends {
    pub transport: Arc<dyn PushTransport>,
    pub fetch: Arc<dyn FetchApi>,
    pub mutations: Arc<dyn MutationApi>,
}

/// Routes push traffic into the reconciler and connection changes into the sweeper.
struct EngineListener {
    reconciler: Arc<EventReconciler>,
    sweeper: Arc<ReconciliationSweeper>,
    events: broadcast::Sender<SyncEvent>,
}

#[async_trait]
impl TopicListener for EngineListener {
    async fn deliver(&self, topic: &Topic, notification: ChangeNotification) {
        self.reconciler.on_event(topic, notification).await;
    }

    async fn connection_changed(&self, status: &TopicStatus) {
        let _ = self.events.send(SyncEvent::TopicStatusChanged(status.clone()));
        if status.state == ConnectionState::Closed {
            return;
        }
        let eligible = status.state == ConnectionState::Connected || status.permanently_degraded;
        self.sweeper.set_eligible(&status.topic, eligible).await;
        if status.state == ConnectionState::Connected {
            self.sweeper
                .request_sweep(&status.topic, SweepTrigger::Connected)
                .await;
        }
    }
}

enum MutationCall {
    Send {
        scope: Scope,
        content: String,
        parent_id: Option<MessageId>,
    },
    AddReaction {
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        reaction_id: ReactionId,
    },
}

/// Client-side synchronization engine: owns the cache and every component that writes to it.
///
/// Consumers read from the cache through the query methods, act through [`SyncEngine::submit`],
/// and follow changes on [`SyncEngine::events`].
pub struct SyncEngine {
    store: SharedStore,
    subscriptions: TopicSubscriptionManager,
    reconciler: Arc<EventReconciler>,
    sweeper: Arc<ReconciliationSweeper>,
    signals: Arc<EphemeralSignalStore>,
    mutations: Arc<dyn MutationApi>,
    events: broadcast::Sender<SyncEvent>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Builds the engine and starts its maintenance loop. Must be called inside a tokio runtime.
    pub fn new(
        user_id: UserId,
        settings: SyncSettings,
        backends: SyncBackends,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let store = SyncStore::new(user_id, settings.mutation_timeout()).shared();
        let (events, _) = broadcast::channel(1024);
        let reconciler = Arc::new(EventReconciler::new(store.clone(), events.clone()));
        let sweeper = Arc::new(ReconciliationSweeper::new(
            store.clone(),
            backends.fetch,
            events.clone(),
            settings.sweep_interval(),
            settings.top_level_fetch_limit,
        ));
        let listener = Arc::new(EngineListener {
            reconciler: Arc::clone(&reconciler),
            sweeper: Arc::clone(&sweeper),
            events: events.clone(),
        });
        let subscriptions = TopicSubscriptionManager::new(
            backends.transport,
            listener,
            settings.clone(),
            Arc::clone(&clock),
        );
        let signals = Arc::new(EphemeralSignalStore::new(Arc::clone(&clock)));
        let maintenance = spawn_maintenance(
            store.clone(),
            Arc::clone(&signals),
            events.clone(),
            Arc::clone(&clock),
            settings.clone(),
        );

        Arc::new(Self {
            store,
            subscriptions,
            reconciler,
            sweeper,
            signals,
            mutations: backends.mutations,
            events,
            clock,
            settings,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub async fn subscribe(&self, topic: Topic) -> SubscriptionHandle {
        self.sweeper.start(&topic).await;
        self.subscriptions.subscribe(topic).await
    }

    /// Releases a handle. When the last one goes the topic is torn down and its cache evicted.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        if !self.subscriptions.unsubscribe(handle).await {
            return false;
        }
        let topic = handle.topic();
        self.teardown(topic).await;
        self.evict(topic).await;
        true
    }

    async fn teardown(&self, topic: &Topic) {
        self.sweeper.stop(topic).await;
        self.reconciler.close_topic(topic).await;
        self.signals.clear_topic(topic).await;
    }

    async fn evict(&self, topic: &Topic) {
        let active = self.subscriptions.active_topics().await;
        let keep_threads: HashSet<MessageId> = active
            .iter()
            .filter_map(|topic| topic.thread_parent().cloned())
            .collect();
        let mut store = self.store.write().await;
        match topic {
            Topic::Thread(parent_id) => {
                let scope = store.cache.message(parent_id).map(|parent| parent.scope.clone());
                match scope {
                    Some(scope) if !active.contains(&Topic::for_scope(&scope)) => {
                        store.cache.evict_scope(&scope, &keep_threads);
                    }
                    _ => store.cache.evict_thread(parent_id),
                }
            }
            Topic::Channel(_) | Topic::Conversation(_) => {
                if let Some(scope) = topic.scope() {
                    store.cache.evict_scope(&scope, &keep_threads);
                }
            }
        }
        debug!(topic = %topic, "engine: evicted topic cache");
    }

    pub async fn topic_status(&self, topic: &Topic) -> Option<TopicStatus> {
        self.subscriptions.status(topic).await
    }

    pub fn status_stream(&self) -> impl Stream<Item = TopicStatus> + Send + 'static {
        self.subscriptions.status_stream()
    }

    /// Applies `request` optimistically and dispatches it to the mutation API in the background.
    pub async fn submit(self: &Arc<Self>, request: MutationRequest) -> SyncResult<LocalId> {
        let (local_id, call, topic) = {
            let mut store = self.store.write().await;
            let SyncStore { cache, pending } = &mut *store;
            let topic = request_topic(cache, &request);
            let local_id = pending.begin(cache, request.clone(), self.clock.now())?;
            let call = match request {
                MutationRequest::SendMessage {
                    scope,
                    parent_id,
                    content,
                } => MutationCall::Send {
                    scope,
                    content,
                    parent_id,
                },
                MutationRequest::AddReaction { message_id, emoji } => {
                    MutationCall::AddReaction { message_id, emoji }
                }
                MutationRequest::RemoveReaction { .. } => {
                    let Some(hidden) = pending.get(&local_id).and_then(|entry| entry.hidden_reaction())
                    else {
                        return Err(SyncError::UnknownMutation(local_id));
                    };
                    MutationCall::RemoveReaction {
                        reaction_id: hidden.id.clone(),
                    }
                }
            };
            (local_id, call, topic)
        };
        if let Some(topic) = topic {
            let _ = self.events.send(SyncEvent::CacheChanged { topic });
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.dispatch(local_id, call).await;
        });
        Ok(local_id)
    }

    /// Submits and waits for the mutation to settle, mapping failures into errors.
    pub async fn submit_and_wait(self: &Arc<Self>, request: MutationRequest) -> SyncResult<LocalId> {
        let local_id = self.submit(request).await?;
        let resolution = self
            .on_resolved(&local_id)
            .await?
            .await
            .map_err(|_| SyncError::UnknownMutation(local_id))?;
        resolution.into_result()?;
        Ok(local_id)
    }

    async fn dispatch(&self, local_id: LocalId, call: MutationCall) {
        let request = async {
            match &call {
                MutationCall::Send {
                    scope,
                    content,
                    parent_id,
                } => {
                    self.mutations
                        .send_message(scope, content, parent_id.as_ref(), &local_id.to_string())
                        .await
                }
                MutationCall::AddReaction { message_id, emoji } => {
                    self.mutations.add_reaction(message_id, emoji).await
                }
                MutationCall::RemoveReaction { reaction_id } => {
                    self.mutations.remove_reaction(reaction_id).await
                }
            }
        };
        let outcome = match tokio::time::timeout(self.settings.mutation_timeout(), request).await {
            Ok(Ok(MutationAck { id })) => MutationOutcome::Confirmed { server_id: id },
            Ok(Err(err)) => MutationOutcome::Failed {
                reason: format!("{err:#}"),
            },
            Err(_) => MutationOutcome::TimedOut,
        };

        let resolved = {
            let mut store = self.store.write().await;
            let SyncStore { cache, pending } = &mut *store;
            pending.resolve(cache, &local_id, outcome)
        };
        match resolved {
            Ok(Some(resolution)) => self.announce(resolution),
            Ok(None) => debug!(local_id = %local_id, "engine: mutation already settled by push"),
            Err(err) => warn!(local_id = %local_id, error = %err, "engine: could not resolve mutation"),
        }
    }

    fn announce(&self, resolution: MutationResolution) {
        let _ = self.events.send(SyncEvent::MutationResolved(resolution));
    }

    /// Resolves with the mutation's final outcome, immediately if it already settled.
    pub async fn on_resolved(
        &self,
        local_id: &LocalId,
    ) -> SyncResult<oneshot::Receiver<MutationResolution>> {
        self.store.write().await.pending.on_resolved(local_id)
    }

    pub async fn top_level(&self, scope: &Scope) -> Vec<Message> {
        self.store.read().await.cache.top_level(scope)
    }

    pub async fn thread(&self, parent_id: &MessageId) -> Vec<Message> {
        self.store.read().await.cache.thread(parent_id)
    }

    pub async fn message(&self, id: &MessageId) -> Option<Message> {
        self.store.read().await.cache.message(id).cloned()
    }

    pub async fn reactions(&self, message_id: &MessageId) -> Vec<ReactionGroup> {
        self.store.read().await.cache.reactions(message_id)
    }

    pub async fn members(&self, scope: &Scope) -> Vec<Membership> {
        self.store.read().await.cache.members(scope)
    }

    /// Runs a sweep of `topic` right away, bypassing throttling.
    pub async fn sweep_now(&self, topic: &Topic) -> SyncResult<SweepDiff> {
        let diff = self.sweeper.sweep(topic).await?;
        if !diff.is_noop() {
            let _ = self.events.send(SyncEvent::CacheChanged {
                topic: topic.clone(),
            });
        }
        Ok(diff)
    }

    /// Marks `user_id` as typing on `topic` for the configured TTL.
    pub async fn set_typing(&self, topic: &Topic, user_id: &UserId) {
        self.signals
            .set_signal(topic, user_id, self.settings.signal_ttl())
            .await;
    }

    pub async fn clear_typing(&self, topic: &Topic, user_id: &UserId) {
        self.signals.clear_signal(topic, user_id).await;
    }

    pub async fn typing(&self, topic: &Topic) -> BTreeSet<UserId> {
        self.signals.get_active(topic).await
    }

    /// Waits until every push notification received so far on `topic` has been merged.
    pub async fn flush(&self, topic: &Topic) {
        self.reconciler.flush(topic).await;
    }

    /// Closes every topic and stops background work. Outstanding mutations stay unresolved.
    pub async fn shutdown(&self) {
        if let Some(maintenance) = self.maintenance.lock().await.take() {
            maintenance.abort();
        }
        for topic in self.subscriptions.close_all().await {
            self.teardown(&topic).await;
        }
        self.sweeper.stop_all().await;
        self.reconciler.shutdown().await;
        self.store.write().await.cache.clear();
        info!("engine: shut down");
    }
}

fn request_topic(cache: &EntityCache, request: &MutationRequest) -> Option<Topic> {
    match request {
        MutationRequest::SendMessage {
            scope, parent_id, ..
        } => Some(match parent_id {
            Some(parent_id) => Topic::Thread(parent_id.clone()),
            None => Topic::for_scope(scope),
        }),
        MutationRequest::AddReaction { message_id, .. }
        | MutationRequest::RemoveReaction { message_id, .. } => {
            let message = cache.message(message_id)?;
            Some(match &message.parent_id {
                Some(parent_id) => Topic::Thread(parent_id.clone()),
                None => Topic::for_scope(&message.scope),
            })
        }
    }
}

fn spawn_maintenance(
    store: SharedStore,
    signals: Arc<EphemeralSignalStore>,
    events: broadcast::Sender<SyncEvent>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(settings.maintenance_tick());
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let expired = {
                let mut store = store.write().await;
                let SyncStore { cache, pending } = &mut *store;
                pending.expire(cache, clock.now())
            };
            for resolution in expired {
                warn!(local_id = %resolution.local_id, "engine: mutation timed out");
                let _ = events.send(SyncEvent::MutationResolved(resolution));
            }
            let purged = signals.purge_expired().await;
            if purged > 0 {
                debug!(purged, "engine: purged expired signals");
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
