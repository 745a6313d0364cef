//! Seams to the collaborators that live outside the engine: the push transport,
//! the fetch API and the mutation API.

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{Message, MessageId, Reaction, ReactionId, Scope, Topic, TopicFilter},
    protocol::{ChangeNotification, MutationAck},
};
use tokio::sync::mpsc;

/// An established push channel for one topic.
///
/// The channel is live while `events` yields; the transport closes it by dropping its
/// sender, and the engine closes it by dropping this value.
pub struct PushChannel {
    pub events: mpsc::Receiver<ChangeNotification>,
}

impl PushChannel {
    pub fn new(events: mpsc::Receiver<ChangeNotification>) -> Self {
        Self { events }
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Opens a channel for `topic` and resolves once the server has acknowledged the filter.
    async fn connect(&self, topic: &Topic, filter: &TopicFilter) -> Result<PushChannel>;
}

#[async_trait]
pub trait FetchApi: Send + Sync {
    /// Most recent top-level messages of `scope`, at most `limit`, in any order.
    async fn fetch_top_level_messages(&self, scope: &Scope, limit: u32) -> Result<Vec<Message>>;
    async fn fetch_thread_children(&self, parent_id: &MessageId) -> Result<Vec<Message>>;
    async fn fetch_reactions(&self, message_ids: &[MessageId]) -> Result<Vec<Reaction>>;
}

#[async_trait]
pub trait MutationApi: Send + Sync {
    async fn send_message(
        &self,
        scope: &Scope,
        content: &str,
        parent_id: Option<&MessageId>,
        client_ref: &str,
    ) -> Result<MutationAck>;
    async fn add_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<MutationAck>;
    async fn remove_reaction(&self, reaction_id: &ReactionId) -> Result<MutationAck>;
}
