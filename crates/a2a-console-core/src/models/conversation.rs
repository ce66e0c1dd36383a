use chrono::{DateTime, Utc};
use serde::Serialize;

use super::event::Event;
use super::message::{Message, Role};

pub const DEFAULT_TITLE: &str = "New Conversation";

/// Longest title derived from a first user message
const MAX_TITLE_CHARS: usize = 50;

/// A single conversation with the agent platform
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    id: String,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
    /// Events of the most recent turn only
    events: Vec<Event>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Restore a conversation shell from remote list metadata
    pub fn from_remote(
        id: impl Into<String>,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            created_at,
            updated_at,
            messages: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// The assistant message that is still streaming, if any
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_streaming())
    }

    /// Turn id of the latest user message
    pub fn current_turn_id(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.turn_id.as_str())
    }

    pub(crate) fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub(crate) fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }

    pub(crate) fn events_mut(&mut self) -> &mut Vec<Event> {
        &mut self.events
    }

    pub(crate) fn set_title(&mut self, title: String) {
        self.title = title;
        self.touch();
    }

    pub(crate) fn set_remote_metadata(&mut self, title: String, updated_at: DateTime<Utc>) {
        self.title = title;
        self.updated_at = updated_at;
    }

    pub(crate) fn set_remote_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = updated_at;
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Rebuild the turn-scoped event list from the last assistant message
    pub(crate) fn rebuild_turn_events(&mut self) {
        self.events = self
            .last_assistant_message()
            .map(|m| m.events.clone())
            .unwrap_or_default();
    }
}

/// Derive a conversation title from the first user message
pub fn derive_title(content: &str) -> String {
    let first_line = content.lines().map(str::trim).find(|l| !l.is_empty());
    let Some(line) = first_line else {
        return DEFAULT_TITLE.to_string();
    };

    if line.chars().count() > MAX_TITLE_CHARS {
        let truncated: String = line.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{}...", truncated.trim_end())
    } else {
        line.to_string()
    }
}
