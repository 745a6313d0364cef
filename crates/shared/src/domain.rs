use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ReactionId);

/// Prefix carried by ids minted locally for optimistic entries.
pub const TEMP_ID_PREFIX: &str = "tmp-";

impl MessageId {
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

impl ReactionId {
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

/// Where a top-level message lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Channel(ChannelId),
    Conversation(ConversationId),
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Channel(_) => "channel",
            Scope::Conversation(_) => "conversation",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Scope::Channel(id) => id.as_str(),
            Scope::Conversation(id) => id.as_str(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A subscription scope over which change notifications are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    Channel(ChannelId),
    Conversation(ConversationId),
    Thread(MessageId),
}

impl Topic {
    pub fn for_scope(scope: &Scope) -> Self {
        match scope {
            Scope::Channel(id) => Topic::Channel(id.clone()),
            Scope::Conversation(id) => Topic::Conversation(id.clone()),
        }
    }

    /// The scope whose top-level list this topic feeds, if any.
    pub fn scope(&self) -> Option<Scope> {
        match self {
            Topic::Channel(id) => Some(Scope::Channel(id.clone())),
            Topic::Conversation(id) => Some(Scope::Conversation(id.clone())),
            Topic::Thread(_) => None,
        }
    }

    pub fn thread_parent(&self) -> Option<&MessageId> {
        match self {
            Topic::Thread(parent_id) => Some(parent_id),
            _ => None,
        }
    }

    /// Server-side row filter replayed on every (re)connect.
    pub fn filter(&self) -> TopicFilter {
        match self {
            Topic::Channel(id) => TopicFilter::new("channel_id", id.as_str()),
            Topic::Conversation(id) => TopicFilter::new("conversation_id", id.as_str()),
            Topic::Thread(parent_id) => TopicFilter::new("parent_id", parent_id.as_str()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Channel(id) => write!(f, "channel:{id}"),
            Topic::Conversation(id) => write!(f, "conversation:{id}"),
            Topic::Thread(parent_id) => write!(f, "thread:{parent_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicFilter {
    pub column: String,
    pub value: String,
}

impl TopicFilter {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_generated: bool,
    #[serde(default)]
    pub reply_count: u32,
}

impl Message {
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Key used to order messages inside a scope or thread.
    pub fn order_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: ReactionId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    pub fn key(&self) -> ReactionKey {
        ReactionKey {
            message_id: self.message_id.clone(),
            user_id: self.user_id.clone(),
            emoji: self.emoji.clone(),
        }
    }
}

/// The (message, user, emoji) triple that identifies a rendered reaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReactionKey {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

impl fmt::Display for ReactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.message_id, self.user_id, self.emoji)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub scope: Scope,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}
