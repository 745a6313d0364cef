use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Membership, Message, MessageId, Reaction, ReactionId, ReactionKey, Scope, Topic, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Message,
    Reaction,
    Membership,
}

/// Row image of a changed message. Delete events routinely carry only `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_generated: Option<bool>,
    /// Opaque reference echoed back by servers that support it; matches optimistic sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl MessageChange {
    /// Builds a full message when every required column is present.
    pub fn to_message(&self) -> Option<Message> {
        Some(Message {
            id: self.id.clone()?,
            scope: self.scope.clone()?,
            parent_id: self.parent_id.clone(),
            sender_id: self.sender_id.clone()?,
            content: self.content.clone().unwrap_or_default(),
            created_at: self.created_at?,
            is_generated: self.is_generated.unwrap_or(false),
            reply_count: 0,
        })
    }

    pub fn from_message(message: &Message) -> Self {
        Self {
            id: Some(message.id.clone()),
            scope: Some(message.scope.clone()),
            parent_id: message.parent_id.clone(),
            sender_id: Some(message.sender_id.clone()),
            content: Some(message.content.clone()),
            created_at: Some(message.created_at),
            is_generated: Some(message.is_generated),
            client_ref: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ReactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ReactionChange {
    pub fn to_reaction(&self) -> Option<Reaction> {
        Some(Reaction {
            id: self.id.clone()?,
            message_id: self.message_id.clone()?,
            user_id: self.user_id.clone()?,
            emoji: self.emoji.clone()?,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }

    /// The fallback match key used when a delete event arrives without an id.
    pub fn key(&self) -> Option<ReactionKey> {
        Some(ReactionKey {
            message_id: self.message_id.clone()?,
            user_id: self.user_id.clone()?,
            emoji: self.emoji.clone()?,
        })
    }

    pub fn from_reaction(reaction: &Reaction) -> Self {
        Self {
            id: Some(reaction.id.clone()),
            message_id: Some(reaction.message_id.clone()),
            user_id: Some(reaction.user_id.clone()),
            emoji: Some(reaction.emoji.clone()),
            created_at: Some(reaction.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub scope: Scope,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

impl MembershipChange {
    pub fn to_membership(&self) -> Membership {
        Membership {
            scope: self.scope.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            last_read_at: self.last_read_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum ChangePayload {
    Message(MessageChange),
    Reaction(ReactionChange),
    Membership(MembershipChange),
}

/// A typed row-change delivered by the push transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub op: ChangeOp,
    pub payload: ChangePayload,
}

impl ChangeNotification {
    pub fn entity_type(&self) -> EntityType {
        match self.payload {
            ChangePayload::Message(_) => EntityType::Message,
            ChangePayload::Reaction(_) => EntityType::Reaction,
            ChangePayload::Membership(_) => EntityType::Membership,
        }
    }

    pub fn message(op: ChangeOp, change: MessageChange) -> Self {
        Self {
            op,
            payload: ChangePayload::Message(change),
        }
    }

    pub fn reaction(op: ChangeOp, change: ReactionChange) -> Self {
        Self {
            op,
            payload: ChangePayload::Reaction(change),
        }
    }

    pub fn membership(op: ChangeOp, change: MembershipChange) -> Self {
        Self {
            op,
            payload: ChangePayload::Membership(change),
        }
    }
}

/// Frames sent by the client over the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: Topic, filter: String },
    Heartbeat,
}

/// Frames received from the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushFrame {
    Subscribed { topic: Topic },
    Change { notification: ChangeNotification },
    Heartbeat,
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub scope: Scope,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddReactionRequest {
    pub emoji: String,
}

/// Acknowledgement of a mutation. Servers may omit the id of what they created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}
