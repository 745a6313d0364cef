use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use rand::Rng;
use shared::{
    domain::{Topic, TopicFilter},
    error::ApiError,
    protocol::ChangeNotification,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    api::{PushChannel, PushTransport},
    backoff::BackoffPolicy,
    clock::Clock,
    config::SyncSettings,
    error::SyncError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Degraded,
    Closed,
}

/// Snapshot of one topic's connection, as published on the status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStatus {
    pub topic: Topic,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub permanently_degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry,
    GiveUp,
}

/// Connection state machine for one topic. Pure: the caller performs the I/O and reports back.
#[derive(Debug, Clone)]
pub struct TopicState {
    topic: Topic,
    filter: TopicFilter,
    state: ConnectionState,
    retry_count: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    permanently_degraded: bool,
}

impl TopicState {
    pub fn new(topic: Topic) -> Self {
        let filter = topic.filter();
        Self {
            topic,
            filter,
            state: ConnectionState::Idle,
            retry_count: 0,
            last_attempt_at: None,
            permanently_degraded: false,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_permanently_degraded(&self) -> bool {
        self.permanently_degraded
    }

    pub fn status(&self) -> TopicStatus {
        TopicStatus {
            topic: self.topic.clone(),
            state: self.state,
            retry_count: self.retry_count,
            last_attempt_at: self.last_attempt_at,
            permanently_degraded: self.permanently_degraded,
        }
    }

    /// `idle | degraded -> connecting`. Refused while a connect is already in flight, after
    /// close, or once the topic gave up.
    pub fn begin_connect(&mut self, now: DateTime<Utc>) -> bool {
        if self.permanently_degraded {
            return false;
        }
        match self.state {
            ConnectionState::Idle | ConnectionState::Degraded => {
                self.state = ConnectionState::Connecting;
                self.last_attempt_at = Some(now);
                true
            }
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Closed => {
                false
            }
        }
    }

    /// `connecting -> connected`; resets the backoff.
    pub fn on_ack(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.retry_count = 0;
        true
    }

    /// `connecting -> degraded` after a failed or timed out connect.
    pub fn on_failure(&mut self, max_attempts: u32) -> FailureAction {
        if self.state == ConnectionState::Closed {
            return FailureAction::GiveUp;
        }
        self.state = ConnectionState::Degraded;
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retry_count >= max_attempts.max(1) {
            self.permanently_degraded = true;
            return FailureAction::GiveUp;
        }
        FailureAction::Retry
    }

    /// The server refused the subscription in a way it will repeat; degrade permanently now.
    pub fn on_rejected(&mut self) -> FailureAction {
        if self.state == ConnectionState::Closed {
            return FailureAction::GiveUp;
        }
        self.state = ConnectionState::Degraded;
        self.retry_count = self.retry_count.saturating_add(1);
        self.permanently_degraded = true;
        FailureAction::GiveUp
    }

    /// `connected -> degraded` when the transport drops an established channel.
    pub fn on_disconnect(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.state = ConnectionState::Degraded;
        true
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Backoff before the next connect attempt, a pure function of `retry_count`.
    pub fn next_delay<R: Rng + ?Sized>(&self, policy: &BackoffPolicy, rng: &mut R) -> Duration {
        policy.delay_with_rng(self.retry_count.saturating_sub(1), rng)
    }
}

/// Receives everything a topic's push channel produces.
#[async_trait]
pub trait TopicListener: Send + Sync {
    async fn deliver(&self, topic: &Topic, notification: ChangeNotification);
    async fn connection_changed(&self, status: &TopicStatus);
}

/// Ticket for an active subscription. Re-subscribing an active topic hands out the same one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: Topic,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

struct ActiveTopic {
    handle: SubscriptionHandle,
    refs: usize,
    state: Arc<Mutex<TopicState>>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct StatusPublisher {
    status_tx: broadcast::Sender<TopicStatus>,
    listener: Arc<dyn TopicListener>,
}

impl StatusPublisher {
    async fn publish(&self, status: TopicStatus) {
        debug!(topic = %status.topic, state = ?status.state, retry_count = status.retry_count, "subscription: state changed");
        let _ = self.status_tx.send(status.clone());
        self.listener.connection_changed(&status).await;
    }
}

/// Owns one push channel per subscribed topic and drives its reconnect loop.
pub struct TopicSubscriptionManager {
    transport: Arc<dyn PushTransport>,
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
    publisher: StatusPublisher,
    topics: Mutex<HashMap<Topic, ActiveTopic>>,
    next_handle: AtomicU64,
}

impl TopicSubscriptionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        listener: Arc<dyn TopicListener>,
        settings: SyncSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            transport,
            settings,
            clock,
            publisher: StatusPublisher {
                status_tx,
                listener,
            },
            topics: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> SubscriptionHandle {
        let mut topics = self.topics.lock().await;
        if let Some(active) = topics.get_mut(&topic) {
            active.refs += 1;
            debug!(topic = %topic, refs = active.refs, "subscription: reusing active topic");
            return active.handle.clone();
        }

        let handle = SubscriptionHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            topic: topic.clone(),
        };
        let state = Arc::new(Mutex::new(TopicState::new(topic.clone())));
        let task = tokio::spawn(run_topic(
            Arc::clone(&self.transport),
            self.publisher.clone(),
            self.settings.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&state),
        ));
        info!(topic = %topic, "subscription: opened");
        topics.insert(
            topic,
            ActiveTopic {
                handle: handle.clone(),
                refs: 1,
                state,
                task,
            },
        );
        handle
    }

    /// Drops one reference. Returns true when this closed the topic.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let active = {
            let mut topics = self.topics.lock().await;
            let Some(active) = topics.get_mut(&handle.topic) else {
                return false;
            };
            if active.handle != *handle {
                warn!(topic = %handle.topic, "subscription: ignoring stale handle");
                return false;
            }
            active.refs -= 1;
            if active.refs > 0 {
                return false;
            }
            match topics.remove(&handle.topic) {
                Some(active) => active,
                None => return false,
            }
        };
        self.close(active).await;
        true
    }

    pub async fn close_all(&self) -> Vec<Topic> {
        let drained: Vec<ActiveTopic> = {
            let mut topics = self.topics.lock().await;
            topics.drain().map(|(_, active)| active).collect()
        };
        let mut closed = Vec::with_capacity(drained.len());
        for active in drained {
            closed.push(active.handle.topic.clone());
            self.close(active).await;
        }
        closed
    }

    async fn close(&self, active: ActiveTopic) {
        active.task.abort();
        let status = {
            let mut state = active.state.lock().await;
            state.close();
            state.status()
        };
        info!(topic = %status.topic, "subscription: closed");
        self.publisher.publish(status).await;
    }

    pub async fn is_active(&self, topic: &Topic) -> bool {
        self.topics.lock().await.contains_key(topic)
    }

    pub async fn active_topics(&self) -> Vec<Topic> {
        self.topics.lock().await.keys().cloned().collect()
    }

    pub async fn status(&self, topic: &Topic) -> Option<TopicStatus> {
        let state = {
            let topics = self.topics.lock().await;
            Arc::clone(&topics.get(topic)?.state)
        };
        let status = state.lock().await.status();
        Some(status)
    }

    pub fn status_stream(&self) -> impl Stream<Item = TopicStatus> + Send + 'static {
        BroadcastStream::new(self.publisher.status_tx.subscribe())
            .filter_map(|status| status.ok())
    }
}

async fn run_topic(
    transport: Arc<dyn PushTransport>,
    publisher: StatusPublisher,
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<TopicState>>,
) {
    let policy = settings.backoff();
    loop {
        let (topic, filter, status) = {
            let mut state = state.lock().await;
            if !state.begin_connect(clock.now()) {
                return;
            }
            (state.topic().clone(), state.filter().clone(), state.status())
        };
        publisher.publish(status).await;

        match connect_once(transport.as_ref(), &topic, &filter, settings.connect_timeout()).await {
            Ok(mut channel) => {
                let status = {
                    let mut state = state.lock().await;
                    state.on_ack();
                    state.status()
                };
                info!(topic = %topic, filter = %filter, "subscription: connected");
                publisher.publish(status).await;

                while let Some(notification) = channel.events.recv().await {
                    publisher.listener.deliver(&topic, notification).await;
                }

                let status = {
                    let mut state = state.lock().await;
                    if !state.on_disconnect() {
                        return;
                    }
                    state.status()
                };
                warn!(topic = %topic, "subscription: push channel dropped");
                publisher.publish(status).await;
            }
            Err(ConnectFailure { error, permanent }) => {
                let (action, status) = {
                    let mut state = state.lock().await;
                    let action = if permanent {
                        state.on_rejected()
                    } else {
                        state.on_failure(settings.max_connect_attempts)
                    };
                    (action, state.status())
                };
                warn!(topic = %topic, error = %error, permanent, retry_count = status.retry_count, "subscription: connect failed");
                publisher.publish(status).await;
                if action == FailureAction::GiveUp {
                    warn!(topic = %topic, "subscription: giving up, topic stays degraded");
                    return;
                }
            }
        }

        let delay = {
            let state = state.lock().await;
            state.next_delay(&policy, &mut rand::thread_rng())
        };
        tokio::time::sleep(delay).await;
    }
}

struct ConnectFailure {
    error: SyncError,
    permanent: bool,
}

async fn connect_once(
    transport: &dyn PushTransport,
    topic: &Topic,
    filter: &TopicFilter,
    timeout: Duration,
) -> Result<PushChannel, ConnectFailure> {
    match tokio::time::timeout(timeout, transport.connect(topic, filter)).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(err)) => Err(ConnectFailure {
            permanent: err
                .downcast_ref::<ApiError>()
                .is_some_and(|rejection| !rejection.is_retryable()),
            error: SyncError::Transport {
                topic: topic.clone(),
                reason: format!("{err:#}"),
            },
        }),
        Err(_) => Err(ConnectFailure {
            permanent: false,
            error: SyncError::Transport {
                topic: topic.clone(),
                reason: format!("no ack within {timeout:?}"),
            },
        }),
    }
}

#[cfg(test)]
#[path = "tests/subscription_tests.rs"]
mod tests;
