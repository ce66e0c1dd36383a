use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::conversation::{Conversation, derive_title};
use super::event::Event;
use super::message::{Feedback, FeedbackKind, Message, MessagePatch, Role};

/// Longest content kept on a message after eviction
pub const EVICTION_PREVIEW_CHARS: usize = 80;

const DEFAULT_MAX_DEBUG_EVENTS: usize = 500;

/// Process-wide handle to the store. Every mutation happens inside one lock
/// scope, so no mutation is ever split by an await point.
pub type SharedStore = Arc<Mutex<ConversationsStore>>;

/// Remote conversation metadata used during list reconciliation
#[derive(Clone, Debug)]
pub struct RemoteConversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a list reconciliation changed locally
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Local-only conversations kept because a session still holds them
    pub preserved: Vec<String>,
    pub active_changed: bool,
}

/// In-memory source of truth for conversations, messages and events
pub struct ConversationsStore {
    conversations: Vec<Conversation>,
    active_conversation_id: Option<String>,
    debug_events: VecDeque<Event>,
    max_debug_events: usize,
    /// Events appended per conversation since the last periodic save
    event_counters: HashMap<String, usize>,
}

impl ConversationsStore {
    pub fn new() -> Self {
        Self::with_debug_capacity(DEFAULT_MAX_DEBUG_EVENTS)
    }

    pub fn with_debug_capacity(max_debug_events: usize) -> Self {
        Self {
            conversations: Vec::new(),
            active_conversation_id: None,
            debug_events: VecDeque::new(),
            max_debug_events,
            event_counters: HashMap::new(),
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Drop every conversation and counter, keeping configuration
    pub fn reset(&mut self) {
        self.conversations.clear();
        self.active_conversation_id = None;
        self.debug_events.clear();
        self.event_counters.clear();
    }

    /// Append a new empty conversation and make it active
    pub fn create_conversation(&mut self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.conversations.push(Conversation::new(id.clone()));
        self.active_conversation_id = Some(id.clone());
        debug!(conv_id = %id, "Conversation created");
        id
    }

    pub fn get_conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id() == id)
    }

    fn get_conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id() == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.id() == id)
    }

    /// All conversations in list order
    pub fn list_all(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn count(&self) -> usize {
        self.conversations.len()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_conversation_id.as_deref()
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active_id().and_then(|id| self.get_conversation(id))
    }

    pub fn set_active(&mut self, id: &str) -> bool {
        if self.position(id).is_some() {
            self.active_conversation_id = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn clear_active(&mut self) {
        self.active_conversation_id = None;
    }

    /// Recent events across all conversations, oldest first
    pub fn debug_events(&self) -> impl Iterator<Item = &Event> {
        self.debug_events.iter()
    }

    /// Append a message and return its id.
    ///
    /// Without a `turn_id`, a user message opens a new turn and an assistant
    /// message joins the latest user turn. Adding an assistant message
    /// finalizes any earlier one that was still streaming.
    pub fn add_message(
        &mut self,
        conversation_id: &str,
        role: Role,
        content: impl Into<String>,
        turn_id: Option<String>,
    ) -> Option<String> {
        let conv = self.get_conversation_mut(conversation_id)?;
        let content = content.into();

        let turn_id = match (turn_id, role) {
            (Some(turn_id), _) => turn_id,
            (None, Role::Assistant) => conv
                .current_turn_id()
                .map(str::to_string)
                .unwrap_or_else(new_turn_id),
            (None, Role::User) => new_turn_id(),
        };

        let is_first_user_message = role == Role::User
            && !conv.messages().iter().any(|m| m.role == Role::User);
        if is_first_user_message {
            conv.set_title(derive_title(&content));
        }

        if role == Role::Assistant {
            for existing in conv.messages_mut().iter_mut().filter(|m| m.is_streaming()) {
                debug!(message_id = %existing.id, "Finalizing superseded streaming message");
                existing.is_final = true;
            }
        }

        let message = Message::new(role, content, turn_id);
        let id = message.id.clone();
        conv.messages_mut().push(message);
        conv.touch();
        Some(id)
    }

    /// Merge `patch` into a message. Finalized messages are immutable and the
    /// patch is ignored for them.
    pub fn update_message(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> bool {
        let Some(conv) = self.get_conversation_mut(conversation_id) else {
            return false;
        };
        let Some(message) = conv.message_mut(message_id) else {
            return false;
        };
        if message.is_final {
            debug!(conv_id = %conversation_id, message_id = %message_id, "Ignoring patch to finalized message");
            return false;
        }
        patch.apply(message);
        conv.touch();
        true
    }

    /// Append to a message's own event list
    pub fn add_event_to_message(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        event: Event,
    ) -> bool {
        let Some(message) = self
            .get_conversation_mut(conversation_id)
            .and_then(|c| c.message_mut(message_id))
        else {
            return false;
        };
        if message.is_final {
            debug!(conv_id = %conversation_id, message_id = %message_id, "Dropping event for finalized message");
            return false;
        }
        message.events.push(event);
        true
    }

    /// Append to the turn-scoped event list and the global debug list.
    ///
    /// Targets the active conversation when `conversation_id` is `None`.
    /// Returns the conversation's event count since the last periodic save,
    /// or 0 when no conversation matched.
    pub fn add_a2a_event(&mut self, event: Event, conversation_id: Option<&str>) -> usize {
        self.debug_events.push_back(event.clone());
        while self.debug_events.len() > self.max_debug_events {
            self.debug_events.pop_front();
        }

        let Some(target) = conversation_id
            .map(str::to_string)
            .or_else(|| self.active_conversation_id.clone())
        else {
            return 0;
        };
        let Some(conv) = self.get_conversation_mut(&target) else {
            return 0;
        };
        conv.events_mut().push(event);

        let counter = self.event_counters.entry(target).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Empty the turn-scoped event list; called when a new turn starts
    pub fn clear_a2a_events(&mut self, conversation_id: Option<&str>) {
        let target = conversation_id
            .map(str::to_string)
            .or_else(|| self.active_conversation_id.clone());
        if let Some(conv) = target.and_then(|id| self.get_conversation_mut(&id)) {
            conv.events_mut().clear();
        }
    }

    pub fn event_count(&self, conversation_id: &str) -> usize {
        self.event_counters
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_event_counter(&mut self, conversation_id: &str) {
        self.event_counters.remove(conversation_id);
    }

    /// Remove a conversation locally and pick the next active one by list
    /// position (next, else previous, else none).
    pub fn delete_conversation(&mut self, id: &str) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.conversations.remove(index);
        self.event_counters.remove(id);

        if self.active_conversation_id.as_deref() == Some(id) {
            self.active_conversation_id = self.neighbour_of(index);
        }
        debug!(conv_id = %id, "Conversation deleted locally");
        true
    }

    fn neighbour_of(&self, index: usize) -> Option<String> {
        if self.conversations.is_empty() {
            return None;
        }
        let index = index.min(self.conversations.len() - 1);
        Some(self.conversations[index].id().to_string())
    }

    pub fn rename_conversation(&mut self, id: &str, title: impl Into<String>) -> bool {
        match self.get_conversation_mut(id) {
            Some(conv) => {
                conv.set_title(title.into());
                true
            }
            None => false,
        }
    }

    /// Record user feedback; allowed on finalized messages
    pub fn set_message_feedback(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        kind: FeedbackKind,
    ) -> bool {
        let Some(message) = self
            .get_conversation_mut(conversation_id)
            .and_then(|c| c.message_mut(message_id))
        else {
            return false;
        };
        message.feedback = Some(Feedback {
            kind,
            submitted: true,
        });
        true
    }

    /// Shrink the named messages of one conversation to a short preview,
    /// dropping their stream buffer and events. Returns how many were evicted.
    pub fn evict_old_message_content(
        &mut self,
        conversation_id: &str,
        message_ids: &[String],
    ) -> usize {
        let Some(conv) = self.get_conversation_mut(conversation_id) else {
            return 0;
        };
        let targets: HashSet<&str> = message_ids.iter().map(String::as_str).collect();

        let mut evicted = 0;
        for message in conv
            .messages_mut()
            .iter_mut()
            .filter(|m| targets.contains(m.id.as_str()))
        {
            if message.content.chars().count() > EVICTION_PREVIEW_CHARS {
                message.content = message.content.chars().take(EVICTION_PREVIEW_CHARS).collect();
            }
            message.raw_stream_content = None;
            message.events.clear();
            evicted += 1;
        }
        debug!(conv_id = %conversation_id, evicted, "Evicted old message content");
        evicted
    }

    /// Clone of a conversation for work that must happen outside the lock
    pub fn snapshot(&self, id: &str) -> Option<Conversation> {
        self.get_conversation(id).cloned()
    }

    /// Replace all messages with the server's copy and rebuild the
    /// turn-scoped events from the last assistant message.
    ///
    /// No session owns these messages, so any saved mid-stream come back
    /// finalized.
    pub(crate) fn replace_messages(&mut self, conversation_id: &str, mut messages: Vec<Message>) -> bool {
        let Some(conv) = self.get_conversation_mut(conversation_id) else {
            return false;
        };
        for message in messages.iter_mut() {
            message.is_final = true;
        }
        *conv.messages_mut() = messages;
        conv.rebuild_turn_events();
        true
    }

    /// Adopt the server's messages while keeping the in-flight turn intact.
    ///
    /// Server messages outside the in-flight turn come first in server order,
    /// followed by the local messages of the in-flight turn. Turn-scoped
    /// events are left alone because the live stream still owns them.
    pub(crate) fn merge_messages_preserving_turn(
        &mut self,
        conversation_id: &str,
        server_messages: Vec<Message>,
        in_flight_turn: &str,
    ) -> bool {
        let Some(conv) = self.get_conversation_mut(conversation_id) else {
            return false;
        };

        let in_flight: Vec<Message> = conv
            .messages()
            .iter()
            .filter(|m| m.turn_id == in_flight_turn)
            .cloned()
            .collect();
        let in_flight_ids: HashSet<&str> = in_flight.iter().map(|m| m.id.as_str()).collect();

        let mut merged: Vec<Message> = server_messages
            .into_iter()
            .filter(|m| m.turn_id != in_flight_turn && !in_flight_ids.contains(m.id.as_str()))
            .map(|mut m| {
                m.is_final = true;
                m
            })
            .collect();
        merged.extend(in_flight.iter().cloned());

        *conv.messages_mut() = merged;
        true
    }

    /// Diff the local list against the server's list.
    ///
    /// Local conversations missing remotely are dropped unless their id is in
    /// `held`. Known conversations keep their loaded messages; new ones are
    /// appended empty. Held conversations keep their local title, which may
    /// not have reached the server yet. If the active conversation
    /// disappears, the nearest survivor by list position becomes active.
    pub(crate) fn reconcile_with_remote(
        &mut self,
        remote: Vec<RemoteConversation>,
        held: &HashSet<String>,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let remote_ids: HashSet<&str> = remote.iter().map(|r| r.id.as_str()).collect();

        let active_index = self
            .active_conversation_id
            .as_deref()
            .and_then(|id| self.position(id));

        let mut survivors_before_active = 0;
        let mut kept = Vec::with_capacity(self.conversations.len());
        for (index, conv) in std::mem::take(&mut self.conversations).into_iter().enumerate() {
            let keep = if remote_ids.contains(conv.id()) {
                true
            } else if held.contains(conv.id()) {
                summary.preserved.push(conv.id().to_string());
                true
            } else {
                summary.removed.push(conv.id().to_string());
                false
            };
            if keep {
                if active_index.is_some_and(|a| index < a) {
                    survivors_before_active += 1;
                }
                kept.push(conv);
            }
        }
        self.conversations = kept;

        for record in remote {
            match self.get_conversation_mut(&record.id) {
                Some(existing) if held.contains(&record.id) => {
                    existing.set_remote_updated_at(record.updated_at)
                }
                Some(existing) => existing.set_remote_metadata(record.title, record.updated_at),
                None => {
                    summary.added.push(record.id.clone());
                    self.conversations.push(Conversation::from_remote(
                        record.id,
                        record.title,
                        record.created_at,
                        record.updated_at,
                    ));
                }
            }
        }

        for id in &summary.removed {
            self.event_counters.remove(id);
        }

        let active_removed = self
            .active_conversation_id
            .as_ref()
            .is_some_and(|id| summary.removed.contains(id));
        if active_removed {
            self.active_conversation_id = self.neighbour_of(survivors_before_active);
            summary.active_changed = true;
        }

        summary
    }
}

impl Default for ConversationsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_turn_id() -> String {
    format!("turn-{}", uuid::Uuid::new_v4())
}
