use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::{
    Message, MessageId, Reaction, ReactionId, ReactionKey, Scope, UserId, TEMP_ID_PREFIX,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::{EntityCache, SweepGuard},
    clock::add_std,
    error::{SyncError, SyncResult},
};

/// How many settled mutations stay queryable through `on_resolved`.
const RESOLVED_HISTORY_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    SendMessage,
    AddReaction,
    RemoveReaction,
}

/// A user action: its kind, target and payload in one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRequest {
    SendMessage {
        scope: Scope,
        parent_id: Option<MessageId>,
        content: String,
    },
    AddReaction {
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        message_id: MessageId,
        emoji: String,
    },
}

impl MutationRequest {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationRequest::SendMessage { .. } => MutationKind::SendMessage,
            MutationRequest::AddReaction { .. } => MutationKind::AddReaction,
            MutationRequest::RemoveReaction { .. } => MutationKind::RemoveReaction,
        }
    }

    fn reaction_key(&self, user_id: &UserId) -> Option<ReactionKey> {
        match self {
            MutationRequest::AddReaction { message_id, emoji }
            | MutationRequest::RemoveReaction { message_id, emoji } => Some(ReactionKey {
                message_id: message_id.clone(),
                user_id: user_id.clone(),
                emoji: emoji.clone(),
            }),
            MutationRequest::SendMessage { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Optimistic,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Confirmed { server_id: Option<String> },
    Failed { reason: String },
    TimedOut,
}

impl MutationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MutationOutcome::Confirmed { .. })
    }
}

/// Final word on a mutation, delivered to whoever waits on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResolution {
    pub local_id: LocalId,
    pub kind: MutationKind,
    pub outcome: MutationOutcome,
}

impl MutationResolution {
    pub fn into_result(self) -> SyncResult<()> {
        match self.outcome {
            MutationOutcome::Confirmed { .. } => Ok(()),
            MutationOutcome::Failed { reason } => Err(SyncError::MutationRejected {
                local_id: self.local_id,
                reason,
            }),
            MutationOutcome::TimedOut => Err(SyncError::MutationTimeout {
                local_id: self.local_id,
            }),
        }
    }
}

#[derive(Debug, Clone)]
enum Placeholder {
    Message(MessageId),
    Reaction(ReactionId),
    Hidden(Reaction),
}

#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub local_id: LocalId,
    pub request: MutationRequest,
    pub status: MutationStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    placeholder: Placeholder,
}

impl PendingMutation {
    /// Temporary id of the optimistic message, for send mutations.
    pub fn placeholder_message(&self) -> Option<&MessageId> {
        match &self.placeholder {
            Placeholder::Message(id) => Some(id),
            _ => None,
        }
    }

    pub fn placeholder_reaction(&self) -> Option<&ReactionId> {
        match &self.placeholder {
            Placeholder::Reaction(id) => Some(id),
            _ => None,
        }
    }

    /// Id to hand to the mutation API for a removal.
    pub fn hidden_reaction(&self) -> Option<&Reaction> {
        match &self.placeholder {
            Placeholder::Hidden(reaction) => Some(reaction),
            _ => None,
        }
    }
}

/// Result of offering an inbound server entity to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoMatch {
    /// No local mutation was waiting for this entity.
    Unmatched,
    /// A mutation absorbed it; carries the resolution when this settled the mutation.
    Matched(Option<MutationResolution>),
}

/// Owns every optimistic transition: placeholder creation, confirmation and rollback.
pub struct PendingMutationTracker {
    user_id: UserId,
    timeout: Duration,
    entries: Vec<PendingMutation>,
    resolved: VecDeque<MutationResolution>,
    waiters: HashMap<LocalId, Vec<oneshot::Sender<MutationResolution>>>,
}

fn temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

impl PendingMutationTracker {
    pub fn new(user_id: UserId, timeout: Duration) -> Self {
        Self {
            user_id,
            timeout,
            entries: Vec::new(),
            resolved: VecDeque::new(),
            waiters: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn get(&self, local_id: &LocalId) -> Option<&PendingMutation> {
        self.entries.iter().find(|entry| &entry.local_id == local_id)
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == MutationStatus::Optimistic)
            .count()
    }

    pub fn status(&self, local_id: &LocalId) -> Option<MutationStatus> {
        if let Some(entry) = self.get(local_id) {
            return Some(entry.status);
        }
        self.resolved
            .iter()
            .find(|resolution| &resolution.local_id == local_id)
            .map(|resolution| match resolution.outcome {
                MutationOutcome::Confirmed { .. } => MutationStatus::Confirmed,
                _ => MutationStatus::Failed,
            })
    }

    fn optimistic_for_key(&self, key: &ReactionKey) -> Option<&PendingMutation> {
        self.entries.iter().find(|entry| {
            entry.status == MutationStatus::Optimistic
                && entry.request.reaction_key(&self.user_id).as_ref() == Some(key)
        })
    }

    /// Records the mutation and applies its optimistic effect to `cache` synchronously.
    pub fn begin(
        &mut self,
        cache: &mut EntityCache,
        request: MutationRequest,
        now: DateTime<Utc>,
    ) -> SyncResult<LocalId> {
        if let Some(key) = request.reaction_key(&self.user_id) {
            if key.message_id.is_temporary() {
                return Err(SyncError::InvalidTarget(format!(
                    "message {} is not confirmed yet",
                    key.message_id
                )));
            }
            if self.optimistic_for_key(&key).is_some() {
                return Err(SyncError::Conflict { key });
            }
        }

        let local_id = LocalId::new();
        let placeholder = match &request {
            MutationRequest::SendMessage {
                scope,
                parent_id,
                content,
            } => {
                if content.trim().is_empty() {
                    return Err(SyncError::InvalidTarget("message content is empty".into()));
                }
                if let Some(parent_id) = parent_id {
                    if parent_id.is_temporary() {
                        return Err(SyncError::InvalidTarget(format!(
                            "cannot reply to unconfirmed message {parent_id}"
                        )));
                    }
                }
                let message = Message {
                    id: MessageId(temp_id()),
                    scope: scope.clone(),
                    parent_id: parent_id.clone(),
                    sender_id: self.user_id.clone(),
                    content: content.clone(),
                    created_at: now,
                    is_generated: false,
                    reply_count: 0,
                };
                let id = message.id.clone();
                cache.insert_message(message)?;
                Placeholder::Message(id)
            }
            MutationRequest::AddReaction { message_id, emoji } => {
                let key = ReactionKey {
                    message_id: message_id.clone(),
                    user_id: self.user_id.clone(),
                    emoji: emoji.clone(),
                };
                if cache.find_reaction(&key).is_some() {
                    return Err(SyncError::InvalidTarget(format!(
                        "reaction {key} is already present"
                    )));
                }
                let reaction = Reaction {
                    id: ReactionId(temp_id()),
                    message_id: message_id.clone(),
                    user_id: self.user_id.clone(),
                    emoji: emoji.clone(),
                    created_at: now,
                };
                let id = reaction.id.clone();
                cache.insert_reaction(reaction);
                Placeholder::Reaction(id)
            }
            MutationRequest::RemoveReaction { message_id, emoji } => {
                let key = ReactionKey {
                    message_id: message_id.clone(),
                    user_id: self.user_id.clone(),
                    emoji: emoji.clone(),
                };
                let Some(existing) = cache.find_reaction(&key) else {
                    return Err(SyncError::InvalidTarget(format!(
                        "no reaction {key} to remove"
                    )));
                };
                if existing.id.is_temporary() {
                    return Err(SyncError::InvalidTarget(format!(
                        "reaction {key} is not confirmed yet"
                    )));
                }
                let existing_id = existing.id.clone();
                match cache.remove_reaction(&existing_id) {
                    Some(hidden) => Placeholder::Hidden(hidden),
                    None => {
                        return Err(SyncError::InvalidTarget(format!(
                            "no reaction {key} to remove"
                        )))
                    }
                }
            }
        };

        debug!(local_id = %local_id, kind = ?request.kind(), "mutation: optimistic entry created");
        self.entries.push(PendingMutation {
            local_id,
            request,
            status: MutationStatus::Optimistic,
            created_at: now,
            deadline: add_std(now, self.timeout),
            placeholder,
        });
        Ok(local_id)
    }

    /// Settles a mutation from the mutation API's answer. Repeat calls are no-ops.
    pub fn resolve(
        &mut self,
        cache: &mut EntityCache,
        local_id: &LocalId,
        outcome: MutationOutcome,
    ) -> SyncResult<Option<MutationResolution>> {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| &entry.local_id == local_id)
        else {
            if self.status(local_id).is_some() {
                return Ok(None);
            }
            return Err(SyncError::UnknownMutation(*local_id));
        };

        if self.entries[index].status != MutationStatus::Optimistic {
            // Already confirmed; only waiting for the echo to swap ids.
            if let MutationOutcome::Confirmed {
                server_id: Some(server_id),
            } = &outcome
            {
                let entry = self.entries.remove(index);
                apply_server_id(cache, &entry, server_id);
            }
            return Ok(None);
        }

        match outcome {
            MutationOutcome::Confirmed { server_id } => {
                let kind = self.entries[index].request.kind();
                let finished = match (&server_id, kind) {
                    (_, MutationKind::RemoveReaction) => true,
                    (Some(server_id), _) => {
                        apply_server_id(cache, &self.entries[index], server_id);
                        true
                    }
                    (None, _) => false,
                };
                if finished {
                    self.entries.remove(index);
                } else {
                    self.entries[index].status = MutationStatus::Confirmed;
                }
                info!(local_id = %local_id, kind = ?kind, "mutation: confirmed by backend");
                Ok(Some(self.settle(MutationResolution {
                    local_id: *local_id,
                    kind,
                    outcome: MutationOutcome::Confirmed { server_id },
                })))
            }
            outcome => {
                let entry = self.entries.remove(index);
                rollback(cache, &entry);
                warn!(local_id = %local_id, outcome = ?outcome, "mutation: rolled back");
                Ok(Some(self.settle(MutationResolution {
                    local_id: *local_id,
                    kind: entry.request.kind(),
                    outcome,
                })))
            }
        }
    }

    /// Offers an inbound message insert to outstanding sends.
    ///
    /// Matches on `client_ref` when the server echoes it, otherwise on the oldest send with the
    /// same scope, parent, sender and content.
    pub fn absorb_message_echo(
        &mut self,
        cache: &mut EntityCache,
        message: &Message,
        client_ref: Option<&str>,
    ) -> EchoMatch {
        let by_ref = client_ref.and_then(|client_ref| self.send_by_ref(client_ref));
        let index = by_ref.or_else(|| {
            if message.sender_id != self.user_id {
                return None;
            }
            self.entries.iter().position(|entry| match &entry.request {
                MutationRequest::SendMessage {
                    scope,
                    parent_id,
                    content,
                } => {
                    scope == &message.scope
                        && parent_id == &message.parent_id
                        && content == &message.content
                }
                _ => false,
            })
        });
        match index {
            Some(index) => self.promote_send(cache, index, message),
            None => EchoMatch::Unmatched,
        }
    }

    /// Offers a redelivered insert of an already cached message to the send that carried
    /// `client_ref`, dropping that send's placeholder.
    pub fn absorb_duplicate_echo(
        &mut self,
        cache: &mut EntityCache,
        message: &Message,
        client_ref: &str,
    ) -> EchoMatch {
        match self.send_by_ref(client_ref) {
            Some(index) => self.promote_send(cache, index, message),
            None => EchoMatch::Unmatched,
        }
    }

    /// Offers messages a sweep fetched to outstanding sends, so a committed send replaces its
    /// placeholder before the sweep would insert it alongside.
    pub fn absorb_fetched(
        &mut self,
        cache: &mut EntityCache,
        fetched: &[Message],
    ) -> (usize, Vec<MutationResolution>) {
        let mut promoted = 0;
        let mut resolutions = Vec::new();
        for message in fetched {
            if message.sender_id != self.user_id || cache.contains_message(&message.id) {
                continue;
            }
            if let EchoMatch::Matched(resolution) = self.absorb_message_echo(cache, message, None) {
                promoted += 1;
                resolutions.extend(resolution);
            }
        }
        (promoted, resolutions)
    }

    fn send_by_ref(&self, client_ref: &str) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.request.kind() == MutationKind::SendMessage
                && entry.local_id.to_string() == client_ref
        })
    }

    fn promote_send(&mut self, cache: &mut EntityCache, index: usize, message: &Message) -> EchoMatch {
        let entry = self.entries.remove(index);
        if let Some(temp_id) = entry.placeholder_message() {
            if let Err(err) = cache.promote_message(temp_id, message.clone()) {
                warn!(error = %err, "mutation: failed to promote optimistic message");
            }
        }
        self.absorbed(entry)
    }

    /// Offers an inbound reaction insert to an outstanding add for the same triple.
    pub fn absorb_reaction_echo(&mut self, cache: &mut EntityCache, reaction: &Reaction) -> EchoMatch {
        let key = reaction.key();
        let Some(index) = self.entries.iter().position(|entry| {
            entry.request.kind() == MutationKind::AddReaction
                && entry.request.reaction_key(&self.user_id).as_ref() == Some(&key)
        }) else {
            return EchoMatch::Unmatched;
        };

        let entry = self.entries.remove(index);
        let swapped = entry
            .placeholder_reaction()
            .is_some_and(|temp_id| cache.rekey_reaction(temp_id, reaction.clone()));
        if !swapped {
            cache.insert_reaction(reaction.clone());
        }
        self.absorbed(entry)
    }

    /// Offers an inbound reaction delete to an outstanding removal of the same reaction,
    /// matched by the hidden reaction's id or by its triple.
    pub fn absorb_reaction_removal(
        &mut self,
        id: Option<&ReactionId>,
        key: Option<&ReactionKey>,
    ) -> EchoMatch {
        let Some(index) = self.entries.iter().position(|entry| {
            let Some(hidden) = entry.hidden_reaction() else {
                return false;
            };
            id.is_some_and(|id| id == &hidden.id) || key.is_some_and(|key| key == &hidden.key())
        }) else {
            return EchoMatch::Unmatched;
        };
        let entry = self.entries.remove(index);
        self.absorbed(entry)
    }

    /// Whether an optimistic removal currently hides the reaction with this triple.
    pub fn hides_reaction(&self, key: &ReactionKey) -> bool {
        self.entries.iter().any(|entry| {
            entry.status == MutationStatus::Optimistic
                && entry.hidden_reaction().is_some_and(|hidden| &hidden.key() == key)
        })
    }

    fn absorbed(&mut self, entry: PendingMutation) -> EchoMatch {
        if entry.status != MutationStatus::Optimistic {
            return EchoMatch::Matched(None);
        }
        debug!(local_id = %entry.local_id, "mutation: confirmed by push echo");
        let resolution = self.settle(MutationResolution {
            local_id: entry.local_id,
            kind: entry.request.kind(),
            outcome: MutationOutcome::Confirmed { server_id: None },
        });
        EchoMatch::Matched(Some(resolution))
    }

    /// Rolls back every optimistic mutation whose deadline has passed.
    pub fn expire(&mut self, cache: &mut EntityCache, now: DateTime<Utc>) -> Vec<MutationResolution> {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.deadline <= now);
        self.entries = kept;

        let mut resolutions = Vec::new();
        for entry in expired {
            if entry.status != MutationStatus::Optimistic {
                // Confirmed without an echo; the next sweep swaps the placeholder.
                continue;
            }
            rollback(cache, &entry);
            warn!(local_id = %entry.local_id, "mutation: timed out, rolled back");
            resolutions.push(self.settle(MutationResolution {
                local_id: entry.local_id,
                kind: entry.request.kind(),
                outcome: MutationOutcome::TimedOut,
            }));
        }
        resolutions
    }

    /// Entities a sweep must leave alone while their mutation is still optimistic.
    pub fn sweep_guard(&self) -> SweepGuard {
        let mut guard = SweepGuard::default();
        for entry in self
            .entries
            .iter()
            .filter(|entry| entry.status == MutationStatus::Optimistic)
        {
            match &entry.placeholder {
                Placeholder::Message(id) => {
                    guard.messages.insert(id.clone());
                }
                Placeholder::Reaction(id) => {
                    guard.reactions.insert(id.clone());
                }
                Placeholder::Hidden(reaction) => {
                    guard.hidden_reactions.insert(reaction.key());
                }
            }
        }
        guard
    }

    /// Registers interest in a mutation's resolution; fires at once if already settled.
    pub fn on_resolved(
        &mut self,
        local_id: &LocalId,
    ) -> SyncResult<oneshot::Receiver<MutationResolution>> {
        let (tx, rx) = oneshot::channel();
        if let Some(done) = self
            .resolved
            .iter()
            .find(|resolution| &resolution.local_id == local_id)
        {
            let _ = tx.send(done.clone());
            return Ok(rx);
        }
        if self.get(local_id).is_none() {
            return Err(SyncError::UnknownMutation(*local_id));
        }
        self.waiters.entry(*local_id).or_default().push(tx);
        Ok(rx)
    }

    fn settle(&mut self, resolution: MutationResolution) -> MutationResolution {
        if let Some(waiters) = self.waiters.remove(&resolution.local_id) {
            for waiter in waiters {
                let _ = waiter.send(resolution.clone());
            }
        }
        if self.resolved.len() >= RESOLVED_HISTORY_LEN {
            self.resolved.pop_front();
        }
        self.resolved.push_back(resolution.clone());
        resolution
    }
}

fn apply_server_id(cache: &mut EntityCache, entry: &PendingMutation, server_id: &str) {
    match &entry.placeholder {
        Placeholder::Message(temp_id) => {
            let Some(mut message) = cache.message(temp_id).cloned() else {
                return;
            };
            message.id = MessageId(server_id.to_string());
            if let Err(err) = cache.promote_message(temp_id, message) {
                warn!(error = %err, "mutation: failed to apply server id");
            }
        }
        Placeholder::Reaction(temp_id) => {
            let Some(mut reaction) = cache.reaction(temp_id).cloned() else {
                return;
            };
            reaction.id = ReactionId(server_id.to_string());
            cache.rekey_reaction(temp_id, reaction);
        }
        Placeholder::Hidden(_) => {}
    }
}

fn rollback(cache: &mut EntityCache, entry: &PendingMutation) {
    match &entry.placeholder {
        Placeholder::Message(temp_id) => {
            cache.remove_message(temp_id);
        }
        Placeholder::Reaction(temp_id) => {
            cache.remove_reaction(temp_id);
        }
        Placeholder::Hidden(reaction) => {
            // The message may have been evicted while the removal was in flight.
            if cache.contains_message(&reaction.message_id) {
                cache.insert_reaction(reaction.clone());
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/pending_tests.rs"]
mod tests;
