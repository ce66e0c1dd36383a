use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use super::error::{RepositoryError, RepositoryResult};
use super::remote_store::{
    BoxFuture, ConversationPatch, ConversationRecord, MessagePayload, NewRun, Page, PageQuery,
    RemoteStore, RunPatch, RunRecord, RunRepository, StoredMessage,
};

/// Upsert payloads kept for inspection; older ones are dropped
const MAX_RECORDED_PAYLOADS: usize = 256;

/// Remote operations, for call accounting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateConversation,
    DeleteConversation,
    UpdateConversation,
    GetConversations,
    GetMessages,
    AddMessage,
    ListRuns,
    CreateRun,
    UpdateRun,
    DeleteRun,
}

/// Failure to return from an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Unavailable,
    Unauthorized,
    NotFound,
    Server,
}

impl Failure {
    fn into_error(self, resource: &str) -> RepositoryError {
        match self {
            Failure::Unavailable => RepositoryError::Unavailable,
            Failure::Unauthorized => RepositoryError::Unauthorized,
            Failure::NotFound => RepositoryError::NotFound {
                resource: resource.to_string(),
            },
            Failure::Server => RepositoryError::Status {
                status: 500,
                body: "internal error".to_string(),
            },
        }
    }
}

#[derive(Default)]
struct State {
    conversations: Vec<ConversationRecord>,
    /// Message documents per conversation, in first-insert order
    messages: HashMap<String, Vec<serde_json::Value>>,
    runs: Vec<RunRecord>,
    calls: HashMap<Operation, usize>,
    failures: HashMap<Operation, Failure>,
    failing_messages: HashMap<String, Failure>,
    last_payloads: VecDeque<MessagePayload>,
}

/// In-memory document store.
///
/// Messages are kept as the JSON documents a real store would hold, so
/// serialization contracts are observable. Useful for tests and offline runs.
#[derive(Clone, Default)]
pub struct InMemoryRemoteStore {
    state: Arc<Mutex<State>>,
    latency: Option<Duration>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Arc::default(),
            latency: Some(latency),
        }
    }

    pub fn seed_conversation(&self, record: ConversationRecord) {
        let mut state = self.state.lock();
        state.messages.entry(record.id.clone()).or_default();
        state.conversations.push(record);
    }

    pub fn seed_message(&self, conversation_id: &str, message: StoredMessage) {
        if let Ok(value) = serde_json::to_value(&message) {
            self.state
                .lock()
                .messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(value);
        }
    }

    /// Make `operation` fail until cleared
    pub fn fail(&self, operation: Operation, failure: Failure) {
        self.state.lock().failures.insert(operation, failure);
    }

    /// Make upserts of one message fail until cleared
    pub fn fail_message(&self, message_id: &str, failure: Failure) {
        self.state
            .lock()
            .failing_messages
            .insert(message_id.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.failing_messages.clear();
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.state.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.last_payloads.clear();
    }

    /// Most recent upsert payloads received since the last `reset_calls`,
    /// in arrival order
    pub fn received_payloads(&self) -> Vec<MessagePayload> {
        self.state.lock().last_payloads.iter().cloned().collect()
    }

    /// Stored message documents of a conversation
    pub fn stored_messages(&self, conversation_id: &str) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .conversations
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().runs.clone()
    }

    /// Count the call and return the injected failure, if any
    fn enter(&self, operation: Operation, resource: &str) -> RepositoryResult<()> {
        let mut state = self.state.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        match state.failures.get(&operation) {
            Some(failure) => Err(failure.into_error(resource)),
            None => Ok(()),
        }
    }

    fn respond<T, F>(&self, operation: Operation, resource: String, body: F) -> BoxFuture<'static, RepositoryResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut State) -> RepositoryResult<T> + Send + 'static,
    {
        let entered = self.enter(operation, &resource);
        let state = self.state.clone();
        let latency = self.latency;
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            entered?;
            let mut state = state.lock();
            body(&mut state)
        })
    }
}

fn paginate<T: Clone>(items: &[T], query: PageQuery) -> Page<T> {
    let page_size = query.page_size.max(1) as usize;
    let start = (query.page.max(1) as usize - 1) * page_size;
    let end = (start + page_size).min(items.len());
    let slice = if start < items.len() {
        items[start..end].to_vec()
    } else {
        Vec::new()
    };
    Page {
        items: slice,
        total: items.len() as u64,
        page: query.page,
        page_size: query.page_size,
        has_more: end < items.len(),
    }
}

impl RemoteStore for InMemoryRemoteStore {
    fn create_conversation(
        &self,
        record: ConversationRecord,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let resource = format!("conversation {}", record.id);
        self.respond(Operation::CreateConversation, resource, move |state| {
            if !state.conversations.iter().any(|c| c.id == record.id) {
                state.messages.entry(record.id.clone()).or_default();
                state.conversations.push(record);
            }
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = id.to_string();
        let resource = format!("conversation {}", id);
        self.respond(Operation::DeleteConversation, resource.clone(), move |state| {
            let before = state.conversations.len();
            state.conversations.retain(|c| c.id != id);
            state.messages.remove(&id);
            if state.conversations.len() == before {
                return Err(RepositoryError::NotFound { resource });
            }
            Ok(())
        })
    }

    fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = id.to_string();
        let resource = format!("conversation {}", id);
        self.respond(Operation::UpdateConversation, resource.clone(), move |state| {
            let record = state
                .conversations
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or(RepositoryError::NotFound { resource })?;
            if let Some(title) = patch.title {
                record.title = title;
            }
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    fn get_conversations(
        &self,
        query: PageQuery,
    ) -> BoxFuture<'static, RepositoryResult<Page<ConversationRecord>>> {
        self.respond(
            Operation::GetConversations,
            "conversations".to_string(),
            move |state| Ok(paginate(&state.conversations, query)),
        )
    }

    fn get_messages(
        &self,
        conversation_id: &str,
        query: PageQuery,
    ) -> BoxFuture<'static, RepositoryResult<Page<StoredMessage>>> {
        let conversation_id = conversation_id.to_string();
        let resource = format!("messages of {}", conversation_id);
        self.respond(Operation::GetMessages, resource.clone(), move |state| {
            let documents = state
                .messages
                .get(&conversation_id)
                .ok_or(RepositoryError::NotFound { resource })?;
            let items = documents
                .iter()
                .map(|doc| serde_json::from_value::<StoredMessage>(doc.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(paginate(&items, query))
        })
    }

    fn add_message(
        &self,
        conversation_id: &str,
        payload: MessagePayload,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let conversation_id = conversation_id.to_string();
        let resource = format!("message {}", payload.message_id);
        let message_failure = self
            .state
            .lock()
            .failing_messages
            .get(&payload.message_id)
            .copied();

        self.respond(Operation::AddMessage, resource.clone(), move |state| {
            if state.last_payloads.len() == MAX_RECORDED_PAYLOADS {
                state.last_payloads.pop_front();
            }
            state.last_payloads.push_back(payload.clone());
            if let Some(failure) = message_failure {
                return Err(failure.into_error(&resource));
            }

            let mut document = serde_json::to_value(&payload)?;
            let documents = state.messages.entry(conversation_id.clone()).or_default();
            let existing = documents
                .iter()
                .position(|doc| doc["message_id"] == payload.message_id.as_str());
            let created_at = existing
                .and_then(|i| documents[i].get("created_at").cloned())
                .unwrap_or_else(|| serde_json::json!(Utc::now()));

            if let Some(object) = document.as_object_mut() {
                object.insert("_id".into(), payload.message_id.clone().into());
                object.insert("conversation_id".into(), conversation_id.into());
                object.insert("created_at".into(), created_at);
            }

            match existing {
                Some(index) => documents[index] = document,
                None => documents.push(document),
            }
            Ok(())
        })
    }
}

impl RunRepository for InMemoryRemoteStore {
    fn list_runs(&self, query: PageQuery) -> BoxFuture<'static, RepositoryResult<Page<RunRecord>>> {
        self.respond(Operation::ListRuns, "runs".to_string(), move |state| {
            Ok(paginate(&state.runs, query))
        })
    }

    fn create_run(&self, run: NewRun) -> BoxFuture<'static, RepositoryResult<RunRecord>> {
        self.respond(Operation::CreateRun, "runs".to_string(), move |state| {
            let now = Utc::now();
            let record = RunRecord {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: run.conversation_id,
                title: run.title,
                status: run.status,
                created_at: now,
                updated_at: now,
            };
            state.runs.push(record.clone());
            Ok(record)
        })
    }

    fn update_run(
        &self,
        id: &str,
        patch: RunPatch,
    ) -> BoxFuture<'static, RepositoryResult<RunRecord>> {
        let id = id.to_string();
        let resource = format!("run {}", id);
        self.respond(Operation::UpdateRun, resource.clone(), move |state| {
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(RepositoryError::NotFound { resource })?;
            if let Some(title) = patch.title {
                run.title = title;
            }
            if let Some(status) = patch.status {
                run.status = status;
            }
            run.updated_at = Utc::now();
            Ok(run.clone())
        })
    }

    fn delete_run(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = id.to_string();
        let resource = format!("run {}", id);
        self.respond(Operation::DeleteRun, resource.clone(), move |state| {
            let before = state.runs.len();
            state.runs.retain(|r| r.id != id);
            if state.runs.len() == before {
                return Err(RepositoryError::NotFound { resource });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, Role};

    fn record(id: &str) -> ConversationRecord {
        ConversationRecord {
            id: id.to_string(),
            title: id.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_message_upserts_by_message_id() {
        let store = InMemoryRemoteStore::new();
        store.create_conversation(record("c1")).await.unwrap();

        let mut message = Message::new(Role::Assistant, "partial", "t1");
        store
            .add_message("c1", MessagePayload::from_message(&message, None))
            .await
            .unwrap();
        message.content = "complete".to_string();
        store
            .add_message("c1", MessagePayload::from_message(&message, None))
            .await
            .unwrap();

        let docs = store.stored_messages("c1");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["content"], "complete");
        assert_eq!(docs[0]["_id"], message.id.as_str());
        assert_eq!(store.call_count(Operation::AddMessage), 2);
    }

    #[tokio::test]
    async fn test_payload_history_is_bounded() {
        let store = InMemoryRemoteStore::new();
        store.create_conversation(record("c1")).await.unwrap();

        let mut message = Message::new(Role::Assistant, "", "t1");
        for i in 0..MAX_RECORDED_PAYLOADS + 10 {
            message.content = format!("chunk {}", i);
            store
                .add_message("c1", MessagePayload::from_message(&message, None))
                .await
                .unwrap();
        }

        let payloads = store.received_payloads();
        assert_eq!(payloads.len(), MAX_RECORDED_PAYLOADS);
        assert_eq!(payloads[0].content, "chunk 10");
        assert_eq!(
            payloads.last().unwrap().content,
            format!("chunk {}", MAX_RECORDED_PAYLOADS + 9)
        );
        assert_eq!(store.stored_messages("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_get_messages_round_trips_documents() {
        let store = InMemoryRemoteStore::new();
        store.create_conversation(record("c1")).await.unwrap();
        let message = Message::new(Role::User, "List my apps", "t1");
        store
            .add_message("c1", MessagePayload::from_message(&message, None))
            .await
            .unwrap();

        let page = store.get_messages("c1", PageQuery::first(10)).await.unwrap();
        assert_eq!(page.items.len(), 1);
        let loaded = page.items[0].clone().into_message().unwrap();
        assert_eq!(loaded.id, message.id);
        assert_eq!(loaded.turn_id, "t1");
    }

    #[tokio::test]
    async fn test_pagination() {
        let store = InMemoryRemoteStore::new();
        for i in 0..5 {
            store.seed_conversation(record(&format!("c{}", i)));
        }
        let first = store.get_conversations(PageQuery { page: 1, page_size: 2 }).await.unwrap();
        assert!(first.has_more);
        assert_eq!(first.total, 5);
        let last = store.get_conversations(PageQuery { page: 3, page_size: 2 }).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted() {
        let store = InMemoryRemoteStore::new();
        store.fail(Operation::GetConversations, Failure::Unavailable);
        let err = store.get_conversations(PageQuery::first(10)).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(store.call_count(Operation::GetConversations), 1);

        store.clear_failures();
        assert!(store.get_conversations(PageQuery::first(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_missing_conversation_is_not_found() {
        let store = InMemoryRemoteStore::new();
        let err = store.delete_conversation("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = InMemoryRemoteStore::new();
        let run = store
            .create_run(NewRun {
                conversation_id: None,
                title: "Sync apps".into(),
                status: "running".into(),
            })
            .await
            .unwrap();
        let updated = store
            .update_run(
                &run.id,
                RunPatch {
                    status: Some("completed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, "completed");
        store.delete_run(&run.id).await.unwrap();
        assert!(store.runs().is_empty());
    }
}
