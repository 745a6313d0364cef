use shared::domain::Topic;

use crate::{cache::SweepDiff, pending::MutationResolution, subscription::TopicStatus};

/// Everything consumers may want to react to, fanned out on one broadcast channel.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    TopicStatusChanged(TopicStatus),
    CacheChanged { topic: Topic },
    MutationResolved(MutationResolution),
    SweepCompleted { topic: Topic, diff: SweepDiff },
    SweepFailed { topic: Topic, reason: String },
}
