use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::RepositoryResult;
use crate::models::{Event, Feedback, FeedbackKind, Message, Role};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Conversation metadata as stored remotely
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub page: u32,
    pub page_size: u32,
}

impl PageQuery {
    pub fn first(page_size: u32) -> Self {
        Self { page: 1, page_size }
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            ..self
        }
    }
}

/// One page of a remote list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub total: u64,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub has_more: bool,
}

fn default_page() -> u32 {
    1
}

/// Follow `has_more` until the server stops or `max_pages` pages were read
pub async fn collect_pages<T, F>(page_size: u32, max_pages: u32, mut fetch: F) -> RepositoryResult<Vec<T>>
where
    F: FnMut(PageQuery) -> BoxFuture<'static, RepositoryResult<Page<T>>>,
{
    let mut query = PageQuery::first(page_size);
    let mut items = Vec::new();
    for _ in 0..max_pages.max(1) {
        let page = fetch(query).await?;
        let has_more = page.has_more && !page.items.is_empty();
        items.extend(page.items);
        if !has_more {
            return Ok(items);
        }
        query = query.next();
    }
    tracing::warn!(max_pages, "Stopped paging before the server ran out of items");
    Ok(items)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFeedback {
    pub rating: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<RemoteFeedback>,
}

/// Upsert body for `add_message`, keyed by `message_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: String,
    pub role: String,
    pub content: String,
    pub metadata: MessageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a2a_events: Option<Vec<Event>>,
}

impl MessagePayload {
    pub fn from_message(message: &Message, events: Option<Vec<Event>>) -> Self {
        Self {
            message_id: message.id.clone(),
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            metadata: MessageMetadata {
                turn_id: message.turn_id.clone(),
                is_final: Some(message.is_final),
                timestamp: Some(message.timestamp),
                feedback: message.feedback.as_ref().map(|f| RemoteFeedback {
                    rating: f.kind.as_rating().to_string(),
                    comment: None,
                    submitted_at: None,
                }),
            },
            a2a_events: events.filter(|e| !e.is_empty()),
        }
    }
}

/// A message item as returned by `get_messages`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub conversation_id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a2a_events: Option<Vec<Event>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<RemoteFeedback>,
}

impl StoredMessage {
    /// Convert into a local message. Items with an unknown role are skipped.
    pub fn into_message(self) -> Option<Message> {
        let role = Role::parse(&self.role)?;
        let feedback = self
            .feedback
            .or(self.metadata.feedback)
            .and_then(|f| FeedbackKind::from_rating(&f.rating))
            .map(|kind| Feedback {
                kind,
                submitted: true,
            });

        Some(Message {
            id: self.message_id.unwrap_or(self.id),
            role,
            content: self.content,
            timestamp: self.metadata.timestamp.unwrap_or(self.created_at),
            turn_id: self.metadata.turn_id,
            is_final: self.metadata.is_final.unwrap_or(true),
            events: self.a2a_events.unwrap_or_default(),
            feedback,
            raw_stream_content: None,
        })
    }
}

/// A tracked agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub title: String,
    pub status: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub title: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Remote document store holding conversations and their messages
pub trait RemoteStore: Send + Sync + 'static {
    fn create_conversation(
        &self,
        record: ConversationRecord,
    ) -> BoxFuture<'static, RepositoryResult<()>>;

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> BoxFuture<'static, RepositoryResult<()>>;

    fn get_conversations(
        &self,
        query: PageQuery,
    ) -> BoxFuture<'static, RepositoryResult<Page<ConversationRecord>>>;

    fn get_messages(
        &self,
        conversation_id: &str,
        query: PageQuery,
    ) -> BoxFuture<'static, RepositoryResult<Page<StoredMessage>>>;

    /// Upsert keyed by `payload.message_id`
    fn add_message(
        &self,
        conversation_id: &str,
        payload: MessagePayload,
    ) -> BoxFuture<'static, RepositoryResult<()>>;
}

/// Remote storage for agent runs
pub trait RunRepository: Send + Sync + 'static {
    fn list_runs(&self, query: PageQuery) -> BoxFuture<'static, RepositoryResult<Page<RunRecord>>>;

    fn create_run(&self, run: NewRun) -> BoxFuture<'static, RepositoryResult<RunRecord>>;

    fn update_run(&self, id: &str, patch: RunPatch)
    -> BoxFuture<'static, RepositoryResult<RunRecord>>;

    fn delete_run(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;
}
