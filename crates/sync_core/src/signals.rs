use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::{Topic, UserId};
use tokio::sync::Mutex;

use crate::clock::{add_std, Clock};

/// Short-lived per-topic presence such as typing indicators. Nothing here is persisted or swept.
pub struct EphemeralSignalStore {
    clock: Arc<dyn Clock>,
    signals: Mutex<HashMap<Topic, HashMap<UserId, DateTime<Utc>>>>,
}

impl EphemeralSignalStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Sets or refreshes `user_id`'s signal on `topic` for `ttl` from now.
    pub async fn set_signal(&self, topic: &Topic, user_id: &UserId, ttl: Duration) {
        let expires_at = add_std(self.clock.now(), ttl);
        self.signals
            .lock()
            .await
            .entry(topic.clone())
            .or_default()
            .insert(user_id.clone(), expires_at);
    }

    pub async fn clear_signal(&self, topic: &Topic, user_id: &UserId) -> bool {
        let mut signals = self.signals.lock().await;
        let Some(users) = signals.get_mut(topic) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            signals.remove(topic);
        }
        removed
    }

    pub async fn get_active(&self, topic: &Topic) -> BTreeSet<UserId> {
        let now = self.clock.now();
        self.signals
            .lock()
            .await
            .get(topic)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(user_id, _)| user_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn clear_topic(&self, topic: &Topic) {
        self.signals.lock().await.remove(topic);
    }

    /// Drops expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut signals = self.signals.lock().await;
        let mut purged = 0;
        signals.retain(|_, users| {
            let before = users.len();
            users.retain(|_, expires_at| *expires_at > now);
            purged += before - users.len();
            !users.is_empty()
        });
        purged
    }
}

#[cfg(test)]
#[path = "tests/signals_tests.rs"]
mod tests;
