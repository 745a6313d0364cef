use std::{sync::Arc, time::Duration};

use shared::domain::UserId;
use tokio::sync::RwLock;

use crate::{cache::EntityCache, pending::PendingMutationTracker};

/// The cache together with the tracker that owns its optimistic entries.
///
/// Both live behind one lock so a merge can consult and update them in a single step.
pub struct SyncStore {
    pub cache: EntityCache,
    pub pending: PendingMutationTracker,
}

impl SyncStore {
    pub fn new(user_id: UserId, mutation_timeout: Duration) -> Self {
        Self {
            cache: EntityCache::new(),
            pending: PendingMutationTracker::new(user_id, mutation_timeout),
        }
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }
}

pub type SharedStore = Arc<RwLock<SyncStore>>;
