use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::{
    Conversation, Event, ReconcileSummary, RemoteConversation, Role, SharedStore, SharedStreams,
};
use crate::repositories::{
    ConversationPatch, ConversationRecord, MessagePayload, RemoteStore, RepositoryError,
    RepositoryResult, collect_pages,
};
use crate::settings::SyncSettings;

/// Result of a message load. Loads never fail loudly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Disabled,
    /// Another load for the conversation is in flight
    AlreadyLoading,
    CoolingDown,
    UnknownConversation,
    Replaced { messages: usize },
    /// Server messages adopted around an unsaved local turn
    Merged { messages: usize },
    /// The remote call failed; local state is untouched
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    Disabled,
    Reconciled(ReconcileSummary),
    /// The remote list could not be fetched; local state is untouched
    Failed,
}

/// Per-message result of one save round
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub attempted: usize,
    pub saved: usize,
    /// Ids of messages whose upsert failed
    pub failed: Vec<String>,
}

/// Keeps the conversations store in step with the remote document store.
///
/// Owns every persistence timer and counter: the debounced post-stream save,
/// the periodic save threshold, per-conversation load cooldowns and the
/// in-flight load set. Store mutations happen under the store lock and are
/// never split by a network await.
#[derive(Clone)]
pub struct SyncEngine {
    store: SharedStore,
    streams: SharedStreams,
    remote: Arc<dyn RemoteStore>,
    settings: Arc<SyncSettings>,
    loading: Arc<Mutex<HashSet<String>>>,
    last_loaded: Arc<Mutex<HashMap<String, Instant>>>,
    pending_saves: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    /// Conversations whose remote registration has not finished yet
    registering: Arc<Mutex<HashSet<String>>>,
    /// Last title the remote store is known to hold, per conversation
    remote_titles: Arc<Mutex<HashMap<String, String>>>,
}

/// Marks a conversation as loading until dropped
struct LoadGuard {
    loading: Arc<Mutex<HashSet<String>>>,
    conversation_id: String,
}

impl LoadGuard {
    fn acquire(loading: &Arc<Mutex<HashSet<String>>>, conversation_id: &str) -> Option<Self> {
        if !loading.lock().insert(conversation_id.to_string()) {
            return None;
        }
        Some(Self {
            loading: loading.clone(),
            conversation_id: conversation_id.to_string(),
        })
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.loading.lock().remove(&self.conversation_id);
    }
}

impl SyncEngine {
    pub fn new(
        store: SharedStore,
        streams: SharedStreams,
        remote: Arc<dyn RemoteStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            streams,
            remote,
            settings: Arc::new(settings),
            loading: Arc::default(),
            last_loaded: Arc::default(),
            pending_saves: Arc::default(),
            registering: Arc::default(),
            remote_titles: Arc::default(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn streams(&self) -> &SharedStreams {
        &self.streams
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn enabled(&self) -> bool {
        self.settings.persistence_enabled
    }

    /// Upsert every message of a conversation.
    ///
    /// Each message is saved independently; one failure does not stop the
    /// others. A message carries its own events, except the last assistant
    /// message which falls back to the turn-scoped events when it has none.
    /// A title derived or changed locally is pushed in the same round.
    pub async fn save_messages_to_server(&self, conversation_id: &str) -> SaveReport {
        if !self.enabled() {
            return SaveReport::default();
        }

        let (payloads, title) = {
            let store = self.store.lock();
            match store.get_conversation(conversation_id) {
                Some(conv) if !conv.is_empty() => (build_payloads(conv), conv.title().to_string()),
                Some(_) => return SaveReport::default(),
                None => {
                    debug!(conv_id = %conversation_id, "Skipping save of unknown conversation");
                    return SaveReport::default();
                }
            }
        };

        let attempted = payloads.len();
        let saves = payloads.into_iter().map(|payload| {
            let message_id = payload.message_id.clone();
            let upsert = self.remote.add_message(conversation_id, payload);
            async move { (message_id, upsert.await) }
        });

        let mut report = SaveReport {
            attempted,
            ..Default::default()
        };
        for (message_id, result) in join_all(saves).await {
            match result {
                Ok(()) => report.saved += 1,
                Err(e) => {
                    warn!(conv_id = %conversation_id, message_id = %message_id, error = ?e, "Failed to save message");
                    report.failed.push(message_id);
                }
            }
        }

        self.push_title(conversation_id, title).await;

        debug!(
            conv_id = %conversation_id,
            saved = report.saved,
            failed = report.failed.len(),
            "Save round finished"
        );
        report
    }

    async fn push_title(&self, conversation_id: &str, title: String) {
        let known = self.remote_titles.lock().get(conversation_id).cloned();
        if known.as_deref() == Some(title.as_str()) {
            return;
        }
        let patch = ConversationPatch {
            title: Some(title.clone()),
        };
        match self.remote.update_conversation(conversation_id, patch).await {
            Ok(()) => {
                debug!(conv_id = %conversation_id, title = %title, "Title pushed");
                self.remote_titles
                    .lock()
                    .insert(conversation_id.to_string(), title);
            }
            Err(e) => {
                warn!(conv_id = %conversation_id, error = ?e, "Failed to push conversation title");
            }
        }
    }

    /// Save after the debounce window, replacing any save already waiting for
    /// this conversation. Settles the conversation's session once saved.
    pub fn schedule_save(&self, conversation_id: &str) {
        let engine = self.clone();
        let id = conversation_id.to_string();
        let delay = self.settings.save_debounce();

        // Held until the handle is stored so the task always finds its slot
        let mut pending = self.pending_saves.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // A newer save, a flush or a delete may have taken the slot
                let mut pending = engine.pending_saves.lock();
                if !pending
                    .get(&id)
                    .is_some_and(|h| h.id() == tokio::task::id())
                {
                    return;
                }
                pending.remove(&id);
            }
            engine.save_messages_to_server(&id).await;
            engine.streams.lock().settle(&id);
        });

        if let Some(previous) = pending.insert(conversation_id.to_string(), handle) {
            previous.abort();
            debug!(conv_id = %conversation_id, "Debounced save rescheduled");
        }
    }

    pub fn has_pending_save(&self, conversation_id: &str) -> bool {
        self.pending_saves.lock().contains_key(conversation_id)
    }

    /// Called whenever a streaming session leaves `Streaming`, by completion
    /// or cancellation alike
    pub fn on_stream_ended(&self, conversation_id: &str) {
        self.store.lock().reset_event_counter(conversation_id);
        self.schedule_save(conversation_id);
    }

    /// Periodic save while streaming. `count` is the value returned by
    /// `add_a2a_event`; once it reaches the threshold the counter restarts
    /// and a save runs in the background. Returns whether a save started.
    pub fn on_event_appended(&self, conversation_id: &str, count: usize) -> bool {
        if count < self.settings.periodic_save_threshold
            || !self.streams.lock().is_streaming(conversation_id)
        {
            return false;
        }
        self.store.lock().reset_event_counter(conversation_id);
        debug!(conv_id = %conversation_id, count, "Event threshold reached, saving");

        let engine = self.clone();
        let id = conversation_id.to_string();
        tokio::spawn(async move {
            engine.save_messages_to_server(&id).await;
        });
        true
    }

    /// Run every waiting debounced save now
    pub async fn flush_pending_saves(&self) {
        let pending: Vec<(String, JoinHandle<()>)> = self.pending_saves.lock().drain().collect();
        for (id, handle) in pending {
            handle.abort();
            self.save_messages_to_server(&id).await;
            self.streams.lock().settle(&id);
        }
    }

    /// Fetch a conversation's messages from the remote store.
    ///
    /// Without an unsaved local turn the server's list replaces the local
    /// one, so annotations never echoed by the server are lost. With one,
    /// the local messages of that turn are kept. Failures leave local state
    /// untouched.
    pub async fn load_messages_from_server(&self, conversation_id: &str, force: bool) -> LoadOutcome {
        if !self.enabled() {
            return LoadOutcome::Disabled;
        }
        if self.store.lock().get_conversation(conversation_id).is_none() {
            return LoadOutcome::UnknownConversation;
        }

        let Some(_guard) = LoadGuard::acquire(&self.loading, conversation_id) else {
            debug!(conv_id = %conversation_id, "Load already in flight");
            return LoadOutcome::AlreadyLoading;
        };

        if !force {
            let cooldown = self.settings.load_cooldown();
            let recent = self
                .last_loaded
                .lock()
                .get(conversation_id)
                .is_some_and(|at| at.elapsed() < cooldown);
            if recent {
                debug!(conv_id = %conversation_id, "Load skipped during cooldown");
                return LoadOutcome::CoolingDown;
            }
        }

        let remote = self.remote.clone();
        let id = conversation_id.to_string();
        let fetched = collect_pages(self.settings.page_size, self.settings.max_pages, |query| {
            remote.get_messages(&id, query)
        })
        .await;

        let items = match fetched {
            Ok(items) => items,
            Err(e) => {
                warn!(conv_id = %conversation_id, error = ?e, "Failed to load messages");
                return LoadOutcome::Failed;
            }
        };
        let messages: Vec<_> = items
            .into_iter()
            .filter_map(|item| item.into_message())
            .collect();
        let count = messages.len();

        let unsaved_turn = self
            .streams
            .lock()
            .unsaved_turn(conversation_id)
            .map(str::to_string);

        let outcome = {
            let mut store = self.store.lock();
            match &unsaved_turn {
                Some(turn) => store
                    .merge_messages_preserving_turn(conversation_id, messages, turn)
                    .then_some(LoadOutcome::Merged { messages: count }),
                None => store
                    .replace_messages(conversation_id, messages)
                    .then_some(LoadOutcome::Replaced { messages: count }),
            }
        };

        match outcome {
            Some(outcome) => {
                self.last_loaded
                    .lock()
                    .insert(conversation_id.to_string(), Instant::now());
                info!(conv_id = %conversation_id, ?outcome, "Messages loaded");
                outcome
            }
            None => {
                debug!(conv_id = %conversation_id, "Conversation removed while loading");
                LoadOutcome::UnknownConversation
            }
        }
    }

    /// Reconcile the local conversation list with the remote one.
    ///
    /// Local conversations the server does not know are dropped unless a
    /// session still holds them or their registration is in flight.
    pub async fn load_conversations_from_server(&self) -> ReconcileOutcome {
        if !self.enabled() {
            return ReconcileOutcome::Disabled;
        }

        let remote = self.remote.clone();
        let fetched = collect_pages(self.settings.page_size, self.settings.max_pages, |query| {
            remote.get_conversations(query)
        })
        .await;

        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                warn!(error = ?e, "Failed to load conversation list");
                return ReconcileOutcome::Failed;
            }
        };

        let mut remote_titles = self.remote_titles.lock();
        for record in &records {
            remote_titles.insert(record.id.clone(), record.title.clone());
        }
        drop(remote_titles);

        let remote_list = records
            .into_iter()
            .map(|r| RemoteConversation {
                id: r.id,
                title: r.title,
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
            .collect();

        let mut held = self.streams.lock().held_conversations();
        held.extend(self.registering.lock().iter().cloned());

        let summary = self.store.lock().reconcile_with_remote(remote_list, &held);

        let mut last_loaded = self.last_loaded.lock();
        let mut remote_titles = self.remote_titles.lock();
        for id in &summary.removed {
            last_loaded.remove(id);
            remote_titles.remove(id);
        }
        drop(remote_titles);
        drop(last_loaded);

        info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            preserved = summary.preserved.len(),
            "Conversation list reconciled"
        );
        ReconcileOutcome::Reconciled(summary)
    }

    /// Create a conversation locally and register it remotely in the
    /// background. Registration failures are logged only.
    pub fn create_conversation(&self) -> String {
        let record = {
            let mut store = self.store.lock();
            let id = store.create_conversation();
            match store.get_conversation(&id) {
                Some(conv) => record_for(conv),
                None => return id,
            }
        };
        let id = record.id.clone();

        if self.enabled() {
            self.registering.lock().insert(id.clone());
            let engine = self.clone();
            tokio::spawn(async move {
                let conv_id = record.id.clone();
                let title = record.title.clone();
                match engine.remote.create_conversation(record).await {
                    Ok(()) => {
                        engine.remote_titles.lock().insert(conv_id.clone(), title);
                    }
                    Err(e) => {
                        warn!(conv_id = %conv_id, error = ?e, "Failed to register conversation remotely");
                    }
                }
                engine.registering.lock().remove(&conv_id);
            });
        }
        id
    }

    /// Delete locally, then remotely. A conversation the server never knew
    /// counts as deleted.
    pub async fn delete_conversation(&self, conversation_id: &str) -> RepositoryResult<()> {
        if let Some(handle) = self.pending_saves.lock().remove(conversation_id) {
            handle.abort();
        }
        self.streams.lock().forget(conversation_id);
        self.last_loaded.lock().remove(conversation_id);
        self.remote_titles.lock().remove(conversation_id);

        if !self.store.lock().delete_conversation(conversation_id) {
            debug!(conv_id = %conversation_id, "Conversation not present locally");
        }

        if !self.enabled() {
            return Ok(());
        }
        match self.remote.delete_conversation(conversation_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(conv_id = %conversation_id, "Conversation never existed remotely");
                Ok(())
            }
            Err(e) => {
                warn!(conv_id = %conversation_id, error = ?e, "Failed to delete conversation remotely");
                Err(e)
            }
        }
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: impl Into<String>,
    ) -> RepositoryResult<()> {
        let title = title.into();
        if !self.store.lock().rename_conversation(conversation_id, title.clone()) {
            return Err(RepositoryError::NotFound {
                resource: format!("conversation {}", conversation_id),
            });
        }
        if !self.enabled() {
            return Ok(());
        }
        self.remote
            .update_conversation(
                conversation_id,
                ConversationPatch {
                    title: Some(title.clone()),
                },
            )
            .await?;
        self.remote_titles
            .lock()
            .insert(conversation_id.to_string(), title);
        Ok(())
    }

    /// Make a conversation active and pull its messages, subject to the
    /// load cooldown
    pub async fn open_conversation(&self, conversation_id: &str) -> LoadOutcome {
        if !self.store.lock().set_active(conversation_id) {
            return LoadOutcome::UnknownConversation;
        }
        self.load_messages_from_server(conversation_id, false).await
    }
}

fn record_for(conv: &Conversation) -> ConversationRecord {
    ConversationRecord {
        id: conv.id().to_string(),
        title: conv.title().to_string(),
        created_at: conv.created_at(),
        updated_at: conv.updated_at(),
    }
}

fn build_payloads(conv: &Conversation) -> Vec<MessagePayload> {
    let last_assistant = conv.last_assistant_message().map(|m| m.id.as_str());
    conv.messages()
        .iter()
        .map(|message| {
            let events: &[Event] = if !message.events.is_empty() {
                &message.events
            } else if message.role == Role::Assistant && Some(message.id.as_str()) == last_assistant {
                conv.events()
            } else {
                &[]
            };
            let events = events.iter().map(Event::without_raw).collect();
            MessagePayload::from_message(message, Some(events))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::models::event::tests_support::typed;
    use crate::models::{ConversationsStore, EventType, Message, MessagePatch, StreamManager};
    use crate::repositories::{Failure, InMemoryRemoteStore, Operation, PageQuery};
    use chrono::Utc;

    fn engine_with(remote: InMemoryRemoteStore, settings: SyncSettings) -> SyncEngine {
        SyncEngine::new(
            ConversationsStore::new().into_shared(),
            StreamManager::new().into_shared(),
            Arc::new(remote),
            settings,
        )
    }

    fn engine() -> (InMemoryRemoteStore, SyncEngine) {
        let remote = InMemoryRemoteStore::new();
        (remote.clone(), engine_with(remote, SyncSettings::default()))
    }

    /// Conversation present both locally and remotely
    fn seeded_conversation(engine: &SyncEngine, remote: &InMemoryRemoteStore) -> String {
        let id = engine.store.lock().create_conversation();
        let record = record_for(engine.store.lock().get_conversation(&id).unwrap());
        remote.seed_conversation(record);
        id
    }

    async fn run_background_tasks() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn tool_pair(engine: &SyncEngine, conv: &str) {
        let mut store = engine.store.lock();
        store.add_a2a_event(typed("e1", EventType::ToolStart, "Calling tool: list_apps"), Some(conv));
        store.add_a2a_event(typed("e2", EventType::ToolEnd, "Tool completed: list_apps"), Some(conv));
    }

    /// One finished turn: "List my apps" / "Here are 5 apps..." with a tool pair
    fn first_turn(engine: &SyncEngine, conv: &str) -> (String, String) {
        let user = engine
            .store
            .lock()
            .add_message(conv, Role::User, "List my apps", Some("t1".into()))
            .unwrap();
        let assistant = engine
            .store
            .lock()
            .add_message(conv, Role::Assistant, "Here are 5 apps...", Some("t1".into()))
            .unwrap();
        tool_pair(engine, conv);
        engine
            .store
            .lock()
            .update_message(conv, &assistant, MessagePatch::finalize());
        (user, assistant)
    }

    #[tokio::test]
    async fn test_save_one_turn_upserts_both_messages() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        let (user, assistant) = first_turn(&engine, &conv);

        let report = engine.save_messages_to_server(&conv).await;
        assert_eq!(report.saved, 2);
        assert_eq!(remote.call_count(Operation::AddMessage), 2);

        let docs = remote.stored_messages(&conv);
        let user_doc = docs.iter().find(|d| d["message_id"] == user.as_str()).unwrap();
        assert!(user_doc.get("a2a_events").is_none());

        let assistant_doc = docs
            .iter()
            .find(|d| d["message_id"] == assistant.as_str())
            .unwrap();
        let events = assistant_doc["a2a_events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.get("raw").is_none()));
        assert_eq!(assistant_doc["metadata"]["turn_id"], "t1");
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        first_turn(&engine, &conv);

        engine.save_messages_to_server(&conv).await;
        let first = remote.stored_messages(&conv);
        engine.save_messages_to_server(&conv).await;
        let second = remote.stored_messages(&conv);

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_turn_events_never_attach_to_earlier_assistant_messages() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        let (_, first_reply) = first_turn(&engine, &conv);
        {
            let mut store = engine.store.lock();
            store.add_message(&conv, Role::User, "And clusters?", Some("t2".into()));
            store.add_message(&conv, Role::Assistant, "", Some("t2".into()));
        }

        engine.save_messages_to_server(&conv).await;
        let payloads = remote.received_payloads();
        let first = payloads.iter().find(|p| p.message_id == first_reply).unwrap();
        assert!(first.a2a_events.is_none());
        let last = payloads.last().unwrap();
        assert_eq!(last.a2a_events.as_ref().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_save_skips_empty_unknown_and_disabled() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        assert_eq!(engine.save_messages_to_server(&conv).await, SaveReport::default());
        assert_eq!(engine.save_messages_to_server("missing").await, SaveReport::default());

        let remote = InMemoryRemoteStore::new();
        let engine = engine_with(remote.clone(), SyncSettings::disabled());
        let conv = engine.store.lock().create_conversation();
        first_turn(&engine, &conv);
        engine.save_messages_to_server(&conv).await;
        assert_eq!(
            engine.load_messages_from_server(&conv, true).await,
            LoadOutcome::Disabled
        );
        assert_eq!(
            engine.load_conversations_from_server().await,
            ReconcileOutcome::Disabled
        );
        assert_eq!(remote.call_count(Operation::AddMessage), 0);
        assert_eq!(remote.call_count(Operation::GetMessages), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_saves_the_rest() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        let (user, assistant) = first_turn(&engine, &conv);
        remote.fail_message(&user, Failure::Unavailable);

        let report = engine.save_messages_to_server(&conv).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.saved, 1);
        assert_eq!(report.failed, vec![user]);
        let docs = remote.stored_messages(&conv);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["message_id"], assistant.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_and_force() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);

        assert_eq!(
            engine.load_messages_from_server(&conv, false).await,
            LoadOutcome::Replaced { messages: 0 }
        );
        assert_eq!(
            engine.load_messages_from_server(&conv, false).await,
            LoadOutcome::CoolingDown
        );
        assert_eq!(remote.call_count(Operation::GetMessages), 1);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        engine.load_messages_from_server(&conv, true).await;
        assert_eq!(remote.call_count(Operation::GetMessages), 2);

        // Force restarted the window
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(
            engine.load_messages_from_server(&conv, false).await,
            LoadOutcome::CoolingDown
        );
        tokio::time::advance(Duration::from_millis(600)).await;
        engine.load_messages_from_server(&conv, false).await;
        assert_eq!(remote.call_count(Operation::GetMessages), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_make_one_call() {
        let remote = InMemoryRemoteStore::with_latency(Duration::from_millis(100));
        let engine = engine_with(remote.clone(), SyncSettings::default());
        let conv = seeded_conversation(&engine, &remote);

        let (a, b) = tokio::join!(
            engine.load_messages_from_server(&conv, false),
            engine.load_messages_from_server(&conv, true)
        );
        assert_eq!(a, LoadOutcome::Replaced { messages: 0 });
        assert_eq!(b, LoadOutcome::AlreadyLoading);
        assert_eq!(remote.call_count(Operation::GetMessages), 1);
        assert!(engine.loading.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_keeps_local_state() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        first_turn(&engine, &conv);

        remote.fail(Operation::GetMessages, Failure::Unauthorized);
        assert_eq!(
            engine.load_messages_from_server(&conv, false).await,
            LoadOutcome::Failed
        );
        assert_eq!(engine.store.lock().get_conversation(&conv).unwrap().messages().len(), 2);

        // A failure does not start the cooldown
        remote.clear_failures();
        assert!(matches!(
            engine.load_messages_from_server(&conv, false).await,
            LoadOutcome::Replaced { .. }
        ));
    }

    #[tokio::test]
    async fn test_load_picks_up_other_device_turn() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        first_turn(&engine, &conv);
        engine.save_messages_to_server(&conv).await;

        // Follow-up written by another device
        let user2 = Message::new(Role::User, "And the clusters?", "t2");
        let mut reply2 = Message::new(Role::Assistant, "3 clusters", "t2");
        reply2.is_final = true;
        let t2_event = typed("t2-e1", EventType::Status, "done");
        remote
            .add_message(&conv, MessagePayload::from_message(&user2, None))
            .await
            .unwrap();
        remote
            .add_message(
                &conv,
                MessagePayload::from_message(&reply2, Some(vec![t2_event])),
            )
            .await
            .unwrap();

        let outcome = engine.load_messages_from_server(&conv, false).await;
        assert_eq!(outcome, LoadOutcome::Replaced { messages: 4 });

        let store = engine.store.lock();
        let loaded = store.get_conversation(&conv).unwrap();
        let contents: Vec<_> = loaded.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["List my apps", "Here are 5 apps...", "And the clusters?", "3 clusters"]
        );
        let event_ids: Vec<_> = loaded.events().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(event_ids, vec!["t2-e1"]);
    }

    #[tokio::test]
    async fn test_load_during_stream_keeps_partial_message() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        first_turn(&engine, &conv);
        engine.save_messages_to_server(&conv).await;

        let streaming = {
            let mut store = engine.store.lock();
            store.add_message(&conv, Role::User, "Next", Some("t2".into()));
            store
                .add_message(&conv, Role::Assistant, "partial", Some("t2".into()))
                .unwrap()
        };
        engine.streams.lock().begin(&conv, &streaming, "t2");

        let outcome = engine.load_messages_from_server(&conv, true).await;
        assert_eq!(outcome, LoadOutcome::Merged { messages: 2 });
        let store = engine.store.lock();
        let loaded = store.get_conversation(&conv).unwrap();
        assert_eq!(loaded.messages().len(), 4);
        assert_eq!(loaded.message(&streaming).unwrap().content, "partial");
        assert!(!loaded.message(&streaming).unwrap().is_final);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_streaming_local_conversation() {
        let (remote, engine) = engine();
        let known = seeded_conversation(&engine, &remote);
        let streaming = engine.store.lock().create_conversation();
        let stale = engine.store.lock().create_conversation();
        engine.streams.lock().begin(&streaming, "m1", "t1");
        remote.seed_conversation(ConversationRecord {
            id: "elsewhere".into(),
            title: "From phone".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let ReconcileOutcome::Reconciled(summary) = engine.load_conversations_from_server().await
        else {
            panic!("expected reconciliation");
        };
        assert_eq!(summary.removed, vec![stale.clone()]);
        assert_eq!(summary.preserved, vec![streaming.clone()]);
        assert_eq!(summary.added, vec!["elsewhere".to_string()]);

        let store = engine.store.lock();
        assert!(store.get_conversation(&known).is_some());
        assert!(store.get_conversation(&streaming).is_some());
        assert!(store.get_conversation(&stale).is_none());
        // The stale conversation was active; whatever now sits at its position takes over
        assert_eq!(store.active_id(), Some("elsewhere"));
    }

    #[tokio::test]
    async fn test_reconcile_failure_is_not_destructive() {
        let (remote, engine) = engine();
        let local = engine.store.lock().create_conversation();
        remote.fail(Operation::GetConversations, Failure::Unavailable);
        assert_eq!(
            engine.load_conversations_from_server().await,
            ReconcileOutcome::Failed
        );
        assert!(engine.store.lock().get_conversation(&local).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_saves_once_after_debounce() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        let (_, assistant) = first_turn(&engine, &conv);
        engine.streams.lock().begin(&conv, &assistant, "t1");
        engine.streams.lock().finish(&conv);

        engine.on_stream_ended(&conv);
        engine.on_stream_ended(&conv);
        assert!(engine.has_pending_save(&conv));
        assert_eq!(engine.store.lock().event_count(&conv), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.call_count(Operation::AddMessage), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(remote.call_count(Operation::AddMessage), 2);
        assert!(!engine.has_pending_save(&conv));
        assert!(engine.streams.lock().phase(&conv).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_threshold_triggers_save_and_resets() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        let assistant = {
            let mut store = engine.store.lock();
            store.add_message(&conv, Role::User, "go", Some("t1".into()));
            store
                .add_message(&conv, Role::Assistant, "", Some("t1".into()))
                .unwrap()
        };
        engine.streams.lock().begin(&conv, &assistant, "t1");

        let mut triggered = 0;
        for i in 0..45 {
            let count = engine
                .store
                .lock()
                .add_a2a_event(typed(&format!("e{}", i), EventType::Status, ""), Some(&conv));
            if engine.on_event_appended(&conv, count) {
                triggered += 1;
            }
        }
        assert_eq!(triggered, 2);
        assert_eq!(engine.store.lock().event_count(&conv), 5);

        run_background_tasks().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(remote.call_count(Operation::AddMessage), 4);
    }

    #[tokio::test]
    async fn test_event_threshold_ignored_when_not_streaming() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        assert!(!engine.on_event_appended(&conv, 20));
    }

    #[tokio::test]
    async fn test_delete_treats_remote_404_as_success() {
        let (remote, engine) = engine();
        let persisted = seeded_conversation(&engine, &remote);
        let local_only = engine.store.lock().create_conversation();

        engine.delete_conversation(&local_only).await.unwrap();
        engine.delete_conversation(&persisted).await.unwrap();
        assert_eq!(engine.store.lock().count(), 0);
        assert!(remote.conversation_ids().is_empty());
    }

    #[tokio::test]
    async fn test_delete_surfaces_unavailable() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        remote.fail(Operation::DeleteConversation, Failure::Unavailable);
        let err = engine.delete_conversation(&conv).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(engine.store.lock().get_conversation(&conv).is_none());
    }

    #[tokio::test]
    async fn test_create_registers_remotely_in_background() {
        let (remote, engine) = engine();
        let conv = engine.create_conversation();
        assert_eq!(engine.store.lock().active_id(), Some(conv.as_str()));

        run_background_tasks().await;
        assert_eq!(remote.conversation_ids(), vec![conv.clone()]);
        assert!(engine.registering.lock().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_does_not_block_local_use() {
        let (remote, engine) = engine();
        remote.fail(Operation::CreateConversation, Failure::Unauthorized);
        let conv = engine.create_conversation();
        run_background_tasks().await;
        assert!(
            engine
                .store
                .lock()
                .add_message(&conv, Role::User, "still works", None)
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_rename_and_open() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        engine.rename_conversation(&conv, "Cluster audit").await.unwrap();
        assert_eq!(engine.store.lock().get_conversation(&conv).unwrap().title(), "Cluster audit");

        remote.fail(Operation::UpdateConversation, Failure::Unauthorized);
        let err = engine.rename_conversation(&conv, "Again").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(engine.rename_conversation("missing", "x").await.unwrap_err().is_not_found());

        engine.store.lock().clear_active();
        assert!(matches!(
            engine.open_conversation(&conv).await,
            LoadOutcome::Replaced { .. }
        ));
        assert_eq!(engine.store.lock().active_id(), Some(conv.as_str()));
        assert_eq!(
            engine.open_conversation("missing").await,
            LoadOutcome::UnknownConversation
        );
    }

    #[tokio::test]
    async fn test_derived_title_survives_reconcile() {
        let (remote, engine) = engine();
        let conv = engine.create_conversation();
        run_background_tasks().await;
        first_turn(&engine, &conv);

        engine.save_messages_to_server(&conv).await;
        assert_eq!(remote.call_count(Operation::UpdateConversation), 1);
        let page = remote.get_conversations(PageQuery::first(10)).await.unwrap();
        assert_eq!(page.items[0].title, "List my apps");

        engine.load_conversations_from_server().await;
        assert_eq!(engine.store.lock().get_conversation(&conv).unwrap().title(), "List my apps");

        // Unchanged titles are not pushed again
        engine.save_messages_to_server(&conv).await;
        assert_eq!(remote.call_count(Operation::UpdateConversation), 1);
    }

    #[tokio::test]
    async fn test_title_push_failure_does_not_fail_save() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        first_turn(&engine, &conv);
        remote.fail(Operation::UpdateConversation, Failure::Unavailable);

        let report = engine.save_messages_to_server(&conv).await;
        assert_eq!(report.saved, 2);

        // Retried on the next round
        remote.clear_failures();
        engine.save_messages_to_server(&conv).await;
        assert_eq!(remote.call_count(Operation::UpdateConversation), 2);
    }

    #[tokio::test]
    async fn test_replacing_load_finalizes_abandoned_stream() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        let user = Message::new(Role::User, "go", "t1");
        let partial = Message::new(Role::Assistant, "half an ans", "t1");
        for message in [&user, &partial] {
            remote
                .add_message(&conv, MessagePayload::from_message(message, None))
                .await
                .unwrap();
        }
        assert_eq!(remote.stored_messages(&conv)[1]["metadata"]["is_final"], false);

        engine.load_messages_from_server(&conv, false).await;
        let store = engine.store.lock();
        let loaded = store.get_conversation(&conv).unwrap();
        assert!(loaded.message(&partial.id).unwrap().is_final);
        assert!(loaded.messages().iter().all(|m| !m.is_streaming()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_save_leaves_newer_slot_alone() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        first_turn(&engine, &conv);
        engine.schedule_save(&conv);

        // Another task takes the slot without aborting the first one
        let newer = tokio::spawn(std::future::pending::<()>());
        let newer_id = newer.id();
        engine.pending_saves.lock().insert(conv.clone(), newer);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(remote.call_count(Operation::AddMessage), 0);
        assert_eq!(
            engine.pending_saves.lock().get(&conv).map(|h| h.id()),
            Some(newer_id)
        );

        engine.flush_pending_saves().await;
        assert_eq!(remote.call_count(Operation::AddMessage), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_pending_save_immediately() {
        let (remote, engine) = engine();
        let conv = seeded_conversation(&engine, &remote);
        first_turn(&engine, &conv);
        engine.schedule_save(&conv);

        engine.flush_pending_saves().await;
        assert_eq!(remote.call_count(Operation::AddMessage), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(remote.call_count(Operation::AddMessage), 2);
    }
}
