use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" | "agent" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Positive,
    Negative,
}

impl FeedbackKind {
    /// Map a remote rating string onto a feedback kind
    pub fn from_rating(rating: &str) -> Option<Self> {
        match rating.to_ascii_lowercase().as_str() {
            "positive" | "thumbs_up" | "up" | "like" => Some(FeedbackKind::Positive),
            "negative" | "thumbs_down" | "down" | "dislike" => Some(FeedbackKind::Negative),
            _ => None,
        }
    }

    pub fn as_rating(&self) -> &'static str {
        match self {
            FeedbackKind::Positive => "positive",
            FeedbackKind::Negative => "negative",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(rename = "type")]
    pub kind: FeedbackKind,
    pub submitted: bool,
}

/// A chat message.
///
/// `is_final == false` marks the assistant message that is still streaming.
/// Once final, only feedback may change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub turn_id: String,
    pub is_final: bool,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_stream_content: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            turn_id: turn_id.into(),
            // Assistant messages start out streaming
            is_final: role == Role::User,
            events: Vec::new(),
            feedback: None,
            raw_stream_content: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.role == Role::Assistant && !self.is_final
    }
}

/// Partial update applied by `ConversationsStore::update_message`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessagePatch {
    /// Replaces the content outright
    pub content: Option<String>,
    /// Appended after `content` is applied
    pub append_content: Option<String>,
    pub raw_stream_content: Option<String>,
    pub is_final: Option<bool>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn append(text: impl Into<String>) -> Self {
        Self {
            append_content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn finalize() -> Self {
        Self {
            is_final: Some(true),
            ..Default::default()
        }
    }

    pub fn with_final(mut self, is_final: bool) -> Self {
        self.is_final = Some(is_final);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub(crate) fn apply(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(text) = self.append_content {
            message.content.push_str(&text);
            message
                .raw_stream_content
                .get_or_insert_with(String::new)
                .push_str(&text);
        }
        if let Some(raw) = self.raw_stream_content {
            message.raw_stream_content = Some(raw);
        }
        if let Some(is_final) = self.is_final {
            message.is_final = is_final;
        }
    }
}
