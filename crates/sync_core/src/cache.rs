use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Membership, Message, MessageId, Reaction, ReactionId, ReactionKey, Scope, UserId},
    protocol::{MembershipChange, MessageChange},
};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Reactions on one message collapsed by emoji, as consumers render them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<UserId>,
    pub reaction_ids: Vec<ReactionId>,
}

/// Entities a sweep must neither evict nor overwrite because a local mutation owns them.
#[derive(Debug, Default, Clone)]
pub struct SweepGuard {
    pub messages: HashSet<MessageId>,
    pub reactions: HashSet<ReactionId>,
    /// Reactions hidden by an outstanding removal; a sweep must not bring them back.
    pub hidden_reactions: HashSet<ReactionKey>,
    /// Known before the fetch and gone since; a stale fetch must not resurrect them.
    pub deleted_messages: HashSet<MessageId>,
    pub deleted_reactions: HashSet<ReactionId>,
}

impl SweepGuard {
    fn protects_reaction_key(&self, key: &ReactionKey, cache: &EntityCache) -> bool {
        self.hidden_reactions.contains(key)
            || cache
                .find_reaction(key)
                .is_some_and(|existing| self.reactions.contains(&existing.id))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepDiff {
    pub inserted: Vec<MessageId>,
    pub removed: Vec<MessageId>,
    pub refreshed: usize,
    pub reactions_inserted: usize,
    pub reactions_removed: usize,
    /// Outstanding sends whose committed message turned up in the fetch.
    pub confirmed: usize,
}

impl SweepDiff {
    pub fn is_noop(&self) -> bool {
        self.inserted.is_empty()
            && self.removed.is_empty()
            && self.confirmed == 0
            && self.reactions_inserted == 0
            && self.reactions_removed == 0
    }
}

/// In-memory store of messages, reactions, thread relationships and memberships.
#[derive(Debug, Default)]
pub struct EntityCache {
    messages: HashMap<MessageId, Message>,
    top_level: HashMap<Scope, Vec<MessageId>>,
    children: HashMap<MessageId, Vec<MessageId>>,
    reactions: HashMap<ReactionId, Reaction>,
    reactions_by_message: HashMap<MessageId, Vec<ReactionId>>,
    members: HashMap<Scope, HashMap<UserId, Membership>>,
}

fn order_key(messages: &HashMap<MessageId, Message>, id: &MessageId) -> (DateTime<Utc>, MessageId) {
    match messages.get(id) {
        Some(message) => {
            let (created_at, id) = message.order_key();
            (created_at, id.clone())
        }
        None => (DateTime::<Utc>::MIN_UTC, id.clone()),
    }
}

/// Inserts `id` keeping `(created_at, id)` order. Returns false when already listed.
fn insert_ordered(
    list: &mut Vec<MessageId>,
    id: MessageId,
    messages: &HashMap<MessageId, Message>,
) -> bool {
    if list.contains(&id) {
        return false;
    }
    let key = order_key(messages, &id);
    let position = list.partition_point(|existing| order_key(messages, existing) < key);
    list.insert(position, id);
    true
}

fn remove_listed(list: &mut Vec<MessageId>, id: &MessageId) -> bool {
    let before = list.len();
    list.retain(|existing| existing != id);
    list.len() != before
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Top-level messages of `scope`, oldest first.
    pub fn top_level(&self, scope: &Scope) -> Vec<Message> {
        self.collect(self.top_level.get(scope))
    }

    pub fn top_level_ids(&self, scope: &Scope) -> Vec<MessageId> {
        self.top_level.get(scope).cloned().unwrap_or_default()
    }

    /// Replies to `parent_id`, oldest first.
    pub fn thread(&self, parent_id: &MessageId) -> Vec<Message> {
        self.collect(self.children.get(parent_id))
    }

    pub fn thread_ids(&self, parent_id: &MessageId) -> Vec<MessageId> {
        self.children.get(parent_id).cloned().unwrap_or_default()
    }

    fn collect(&self, ids: Option<&Vec<MessageId>>) -> Vec<Message> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.messages.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Inserts a message observed for the first time.
    ///
    /// A repeated id is a duplicate delivery and leaves the cache untouched. A child bumps its
    /// parent's `reply_count` only the first time it joins the parent's thread list.
    pub fn insert_message(&mut self, message: Message) -> Result<InsertOutcome, SyncError> {
        if let Some(existing) = self.messages.get(&message.id) {
            if existing.scope != message.scope
                || existing.parent_id != message.parent_id
                || existing.sender_id != message.sender_id
            {
                return Err(SyncError::MergeInvariantViolation {
                    message_id: message.id,
                    detail: "duplicate id with conflicting immutable fields".into(),
                });
            }
            return Ok(InsertOutcome::Duplicate);
        }

        let id = message.id.clone();
        let scope = message.scope.clone();
        let parent_id = message.parent_id.clone();
        self.messages.insert(id.clone(), message);

        match parent_id {
            Some(parent_id) => {
                let list = self.children.entry(parent_id.clone()).or_default();
                if insert_ordered(list, id, &self.messages) {
                    if let Some(parent) = self.messages.get_mut(&parent_id) {
                        parent.reply_count += 1;
                    }
                }
            }
            None => {
                let list = self.top_level.entry(scope).or_default();
                insert_ordered(list, id, &self.messages);
            }
        }
        Ok(InsertOutcome::Inserted)
    }

    /// Applies mutable columns of an update in place. Derived counts are never taken from it.
    pub fn update_message(&mut self, change: &MessageChange) -> bool {
        let Some(id) = change.id.as_ref() else {
            return false;
        };
        let Some(message) = self.messages.get_mut(id) else {
            return false;
        };
        let mut changed = false;
        if let Some(content) = &change.content {
            if &message.content != content {
                message.content = content.clone();
                changed = true;
            }
        }
        if let Some(is_generated) = change.is_generated {
            if message.is_generated != is_generated {
                message.is_generated = is_generated;
                changed = true;
            }
        }
        changed
    }

    /// Deletes a message, its cached replies and their reactions.
    pub fn remove_message(&mut self, id: &MessageId) -> Option<Message> {
        let message = self.messages.remove(id)?;
        match &message.parent_id {
            Some(parent_id) => {
                let was_listed = self
                    .children
                    .get_mut(parent_id)
                    .is_some_and(|list| remove_listed(list, id));
                if was_listed {
                    if let Some(parent) = self.messages.get_mut(parent_id) {
                        parent.reply_count = parent.reply_count.saturating_sub(1);
                    }
                }
            }
            None => {
                if let Some(list) = self.top_level.get_mut(&message.scope) {
                    remove_listed(list, id);
                }
            }
        }
        self.drop_thread(id);
        self.drop_reactions_of(id);
        Some(message)
    }

    /// Swaps an optimistic message for its server-issued counterpart without re-counting it.
    pub fn promote_message(
        &mut self,
        temp_id: &MessageId,
        mut server: Message,
    ) -> Result<InsertOutcome, SyncError> {
        if self.messages.contains_key(&server.id) {
            self.remove_message(temp_id);
            return Ok(InsertOutcome::Duplicate);
        }
        let Some(placeholder) = self.messages.remove(temp_id) else {
            return self.insert_message(server);
        };
        if placeholder.parent_id != server.parent_id || placeholder.scope != server.scope {
            // Not the same logical entity after all; undo the placeholder and count afresh.
            self.messages.insert(temp_id.clone(), placeholder);
            self.remove_message(temp_id);
            return self.insert_message(server);
        }

        let list = match &placeholder.parent_id {
            Some(parent_id) => self.children.get_mut(parent_id),
            None => self.top_level.get_mut(&placeholder.scope),
        };
        if let Some(list) = list {
            remove_listed(list, temp_id);
        }
        if let Some(reaction_ids) = self.reactions_by_message.remove(temp_id) {
            for reaction_id in &reaction_ids {
                if let Some(reaction) = self.reactions.get_mut(reaction_id) {
                    reaction.message_id = server.id.clone();
                }
            }
            self.reactions_by_message
                .insert(server.id.clone(), reaction_ids);
        }
        server.reply_count = server.reply_count.max(placeholder.reply_count);

        let id = server.id.clone();
        let scope = server.scope.clone();
        let parent_id = server.parent_id.clone();
        self.messages.insert(id.clone(), server);
        match parent_id {
            Some(parent_id) => {
                let list = self.children.entry(parent_id).or_default();
                insert_ordered(list, id, &self.messages);
            }
            None => {
                let list = self.top_level.entry(scope).or_default();
                insert_ordered(list, id, &self.messages);
            }
        }
        Ok(InsertOutcome::Inserted)
    }

    fn drop_thread(&mut self, parent_id: &MessageId) {
        if let Some(child_ids) = self.children.remove(parent_id) {
            for child_id in child_ids {
                self.messages.remove(&child_id);
                self.drop_reactions_of(&child_id);
                self.drop_thread(&child_id);
            }
        }
    }

    fn drop_reactions_of(&mut self, message_id: &MessageId) {
        if let Some(reaction_ids) = self.reactions_by_message.remove(message_id) {
            for reaction_id in reaction_ids {
                self.reactions.remove(&reaction_id);
            }
        }
    }

    pub fn reaction(&self, id: &ReactionId) -> Option<&Reaction> {
        self.reactions.get(id)
    }

    pub fn find_reaction(&self, key: &ReactionKey) -> Option<&Reaction> {
        self.reactions_by_message
            .get(&key.message_id)?
            .iter()
            .filter_map(|id| self.reactions.get(id))
            .find(|reaction| reaction.user_id == key.user_id && reaction.emoji == key.emoji)
    }

    /// Raw reactions on a message in arrival order.
    pub fn reaction_list(&self, message_id: &MessageId) -> Vec<Reaction> {
        self.reactions_by_message
            .get(message_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.reactions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reactions on a message grouped by emoji, ordered by first use.
    pub fn reactions(&self, message_id: &MessageId) -> Vec<ReactionGroup> {
        let mut reactions = self.reaction_list(message_id);
        reactions.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut groups: Vec<ReactionGroup> = Vec::new();
        for reaction in reactions {
            match groups.iter_mut().find(|group| group.emoji == reaction.emoji) {
                Some(group) => {
                    group.count += 1;
                    group.user_ids.push(reaction.user_id);
                    group.reaction_ids.push(reaction.id);
                }
                None => groups.push(ReactionGroup {
                    emoji: reaction.emoji,
                    count: 1,
                    user_ids: vec![reaction.user_id],
                    reaction_ids: vec![reaction.id],
                }),
            }
        }
        groups
    }

    /// Inserts a reaction unless its id or its (message, user, emoji) triple is already shown.
    /// A server reaction takes over a leftover optimistic placeholder for the same triple.
    pub fn insert_reaction(&mut self, reaction: Reaction) -> InsertOutcome {
        if self.reactions.contains_key(&reaction.id) {
            return InsertOutcome::Duplicate;
        }
        if let Some(existing) = self.find_reaction(&reaction.key()) {
            if existing.id.is_temporary() && !reaction.id.is_temporary() {
                let placeholder_id = existing.id.clone();
                self.rekey_reaction(&placeholder_id, reaction);
                return InsertOutcome::Inserted;
            }
            return InsertOutcome::Duplicate;
        }
        self.reactions_by_message
            .entry(reaction.message_id.clone())
            .or_default()
            .push(reaction.id.clone());
        self.reactions.insert(reaction.id.clone(), reaction);
        InsertOutcome::Inserted
    }

    /// Replaces the reaction stored under `old_id` by `reaction`, keeping its slot.
    pub fn rekey_reaction(&mut self, old_id: &ReactionId, reaction: Reaction) -> bool {
        if self.reactions.contains_key(&reaction.id) {
            return self.remove_reaction(old_id).is_some();
        }
        let Some(previous) = self.reactions.remove(old_id) else {
            return false;
        };
        if let Some(ids) = self.reactions_by_message.get_mut(&previous.message_id) {
            if let Some(slot) = ids.iter_mut().find(|id| *id == old_id) {
                *slot = reaction.id.clone();
            }
        }
        self.reactions.insert(reaction.id.clone(), reaction);
        true
    }

    pub fn remove_reaction(&mut self, id: &ReactionId) -> Option<Reaction> {
        let reaction = self.reactions.remove(id)?;
        if let Some(ids) = self.reactions_by_message.get_mut(&reaction.message_id) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.reactions_by_message.remove(&reaction.message_id);
            }
        }
        Some(reaction)
    }

    pub fn remove_reaction_by_key(&mut self, key: &ReactionKey) -> Option<Reaction> {
        let id = self.find_reaction(key)?.id.clone();
        self.remove_reaction(&id)
    }

    pub fn members(&self, scope: &Scope) -> Vec<Membership> {
        let mut members: Vec<Membership> = self
            .members
            .get(scope)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    }

    /// Creates or updates a membership; absent optional columns keep their cached value.
    pub fn upsert_membership(&mut self, change: &MembershipChange) -> bool {
        let members = self.members.entry(change.scope.clone()).or_default();
        match members.get_mut(&change.user_id) {
            Some(existing) => {
                let mut changed = false;
                if change.display_name.is_some() && existing.display_name != change.display_name {
                    existing.display_name = change.display_name.clone();
                    changed = true;
                }
                if change.last_read_at.is_some() && existing.last_read_at != change.last_read_at {
                    existing.last_read_at = change.last_read_at;
                    changed = true;
                }
                changed
            }
            None => {
                members.insert(change.user_id.clone(), change.to_membership());
                true
            }
        }
    }

    pub fn remove_membership(&mut self, scope: &Scope, user_id: &UserId) -> Option<Membership> {
        let members = self.members.get_mut(scope)?;
        let removed = members.remove(user_id);
        if members.is_empty() {
            self.members.remove(scope);
        }
        removed
    }

    /// Corrects a scope's top-level list against a server fetch.
    ///
    /// When the fetch filled its `limit` the server window is partial, so only local messages
    /// at or after the oldest fetched one are candidates for removal.
    pub fn reconcile_top_level(
        &mut self,
        scope: &Scope,
        fetched: Vec<Message>,
        window_complete: bool,
        guard: &SweepGuard,
    ) -> SweepDiff {
        let mut diff = SweepDiff::default();
        let fetched: Vec<Message> = fetched
            .into_iter()
            .filter(|message| message.is_top_level() && &message.scope == scope)
            .collect();
        let fetched_ids: HashSet<MessageId> = fetched.iter().map(|m| m.id.clone()).collect();
        let window_start = if window_complete {
            None
        } else {
            fetched.iter().map(|m| m.created_at).min()
        };

        for id in self.top_level_ids(scope) {
            if fetched_ids.contains(&id) || guard.messages.contains(&id) {
                continue;
            }
            let in_window = match (window_start, self.messages.get(&id)) {
                (Some(start), Some(message)) => message.created_at >= start,
                _ => true,
            };
            if in_window && self.remove_message(&id).is_some() {
                diff.removed.push(id);
            }
        }

        for mut message in fetched {
            if guard.deleted_messages.contains(&message.id) {
                continue;
            }
            let guarded_replies = self
                .children
                .get(&message.id)
                .is_some_and(|ids| ids.iter().any(|id| guard.messages.contains(id)));
            if let Some(existing) = self.messages.get_mut(&message.id) {
                // The server count may or may not include replies still in flight.
                if guarded_replies {
                    message.reply_count = message.reply_count.max(existing.reply_count);
                }
                if *existing != message {
                    *existing = message;
                    diff.refreshed += 1;
                }
                continue;
            }
            let id = message.id.clone();
            if let Ok(InsertOutcome::Inserted) = self.insert_message(message) {
                diff.inserted.push(id);
            }
        }
        diff
    }

    /// Corrects a thread against a complete fetch of its replies and recounts the parent.
    pub fn reconcile_thread(
        &mut self,
        parent_id: &MessageId,
        fetched: Vec<Message>,
        guard: &SweepGuard,
    ) -> SweepDiff {
        let mut diff = SweepDiff::default();
        let fetched: Vec<Message> = fetched
            .into_iter()
            .filter(|message| message.parent_id.as_ref() == Some(parent_id))
            .collect();
        let fetched_ids: HashSet<MessageId> = fetched.iter().map(|m| m.id.clone()).collect();

        for id in self.thread_ids(parent_id) {
            if fetched_ids.contains(&id) || guard.messages.contains(&id) {
                continue;
            }
            if self.remove_message(&id).is_some() {
                diff.removed.push(id);
            }
        }

        for message in fetched {
            if guard.deleted_messages.contains(&message.id) {
                continue;
            }
            if let Some(existing) = self.messages.get_mut(&message.id) {
                if *existing != message {
                    *existing = message;
                    diff.refreshed += 1;
                }
                continue;
            }
            let id = message.id.clone();
            if let Ok(InsertOutcome::Inserted) = self.insert_message(message) {
                diff.inserted.push(id);
            }
        }

        let reply_count = self.children.get(parent_id).map_or(0, Vec::len) as u32;
        if let Some(parent) = self.messages.get_mut(parent_id) {
            parent.reply_count = reply_count;
        }
        diff
    }

    /// Corrects the reactions of `message_ids` against a server fetch.
    pub fn reconcile_reactions(
        &mut self,
        message_ids: &[MessageId],
        fetched: Vec<Reaction>,
        guard: &SweepGuard,
        diff: &mut SweepDiff,
    ) {
        let fetched_ids: HashSet<ReactionId> = fetched.iter().map(|r| r.id.clone()).collect();
        for message_id in message_ids {
            for reaction in self.reaction_list(message_id) {
                if fetched_ids.contains(&reaction.id) || guard.reactions.contains(&reaction.id) {
                    continue;
                }
                if self.remove_reaction(&reaction.id).is_some() {
                    diff.reactions_removed += 1;
                }
            }
        }
        for reaction in fetched {
            if !self.messages.contains_key(&reaction.message_id)
                || guard.deleted_reactions.contains(&reaction.id)
                || guard.protects_reaction_key(&reaction.key(), self)
            {
                continue;
            }
            if self.insert_reaction(reaction) == InsertOutcome::Inserted {
                diff.reactions_inserted += 1;
            }
        }
    }

    /// Drops everything cached for `scope` except threads rooted at `keep_threads`.
    pub fn evict_scope(&mut self, scope: &Scope, keep_threads: &HashSet<MessageId>) {
        for id in self.top_level_ids(scope) {
            if keep_threads.contains(&id) {
                continue;
            }
            if let Some(list) = self.top_level.get_mut(scope) {
                remove_listed(list, &id);
            }
            self.messages.remove(&id);
            self.drop_thread(&id);
            self.drop_reactions_of(&id);
        }
        if self.top_level.get(scope).is_some_and(Vec::is_empty) {
            self.top_level.remove(scope);
        }
        self.members.remove(scope);
    }

    /// Drops a thread's cached replies. Eviction is not deletion: the parent keeps its count.
    pub fn evict_thread(&mut self, parent_id: &MessageId) {
        self.drop_thread(parent_id);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
