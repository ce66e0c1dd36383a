use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::models::{EndedSession, Event, MessagePatch, Role, StreamHandle};
use crate::services::{EventNormalizer, ExtractedView, SyncEngine, extract, is_agent_message};

/// Appended to an assistant message when the user stops the stream
pub const CANCELLED_NOTICE: &str = "\n\n*Generation cancelled by user.*";

/// Ids created when a turn starts
#[derive(Clone, Debug)]
pub struct TurnStart {
    pub turn_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    /// Given to the transport; flips when the turn is cancelled
    pub handle: StreamHandle,
}

/// Drives one console session: raw protocol messages in, store mutations,
/// session transitions and persistence triggers out.
pub struct ConsoleController {
    engine: SyncEngine,
    /// One normalizer per conversation so timestamps stay monotonic per turn
    normalizers: Mutex<HashMap<String, EventNormalizer>>,
}

impl ConsoleController {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            normalizers: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Open a new turn: clear the turn-scoped events, add the user message
    /// and an empty streaming assistant reply, and enter `Streaming`. A turn
    /// still streaming in the conversation is cancelled first.
    ///
    /// Returns `None` when the conversation does not exist.
    pub fn start_turn(&self, conversation_id: &str, user_text: &str) -> Option<TurnStart> {
        let still_streaming = self.engine.streams().lock().is_streaming(conversation_id);
        if still_streaming {
            debug!(conv_id = %conversation_id, "New turn interrupts the streaming one");
            self.cancel_turn(conversation_id);
        }

        let turn_id = format!("turn-{}", uuid::Uuid::new_v4());
        let (user_message_id, assistant_message_id) = {
            let mut store = self.engine.store().lock();
            store.get_conversation(conversation_id)?;
            store.clear_a2a_events(Some(conversation_id));
            let user = store.add_message(conversation_id, Role::User, user_text, Some(turn_id.clone()))?;
            let assistant =
                store.add_message(conversation_id, Role::Assistant, "", Some(turn_id.clone()))?;
            (user, assistant)
        };

        let handle = self
            .engine
            .streams()
            .lock()
            .begin(conversation_id, &assistant_message_id, &turn_id);
        self.normalizers
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .begin_turn();

        info!(conv_id = %conversation_id, turn_id = %turn_id, "Turn started");
        Some(TurnStart {
            turn_id,
            user_message_id,
            assistant_message_id,
            handle,
        })
    }

    /// Normalize one raw protocol message and apply it to the streaming turn.
    ///
    /// Messages that do not normalize, or that arrive when no turn is
    /// streaming (for example after a cancel), are dropped. Returns the
    /// applied event.
    pub fn ingest(&self, conversation_id: &str, raw: Value) -> Option<Event> {
        let event = self
            .normalizers
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .normalize(raw)?;

        let message_id = {
            let streams = self.engine.streams().lock();
            match streams.active_message(conversation_id) {
                Some((message_id, _)) => message_id.to_string(),
                None => {
                    debug!(conv_id = %conversation_id, event_type = ?event.event_type, "Dropping event outside a streaming turn");
                    return None;
                }
            }
        };

        let count = {
            let mut store = self.engine.store().lock();
            if is_agent_message(&event) && !event.display_content.is_empty() {
                store.update_message(
                    conversation_id,
                    &message_id,
                    MessagePatch::append(event.display_content.clone()),
                );
            }
            store.add_event_to_message(conversation_id, &message_id, event.clone());
            store.add_a2a_event(event.clone(), Some(conversation_id))
        };
        self.engine.on_event_appended(conversation_id, count);
        Some(event)
    }

    /// Natural end of the stream
    pub fn complete_turn(&self, conversation_id: &str) -> Option<EndedSession> {
        let ended = self.engine.streams().lock().finish(conversation_id)?;
        self.engine
            .store()
            .lock()
            .update_message(conversation_id, &ended.message_id, MessagePatch::finalize());
        self.engine.on_stream_ended(conversation_id);
        info!(conv_id = %conversation_id, "Turn completed");
        Some(ended)
    }

    /// User cancellation. Signals the transport, finalizes the reply with a
    /// notice and then persists exactly as a completed turn would.
    pub fn cancel_turn(&self, conversation_id: &str) -> Option<EndedSession> {
        let ended = self.engine.streams().lock().cancel(conversation_id)?;
        self.engine.store().lock().update_message(
            conversation_id,
            &ended.message_id,
            MessagePatch::append(CANCELLED_NOTICE).with_final(true),
        );
        self.engine.on_stream_ended(conversation_id);
        info!(conv_id = %conversation_id, "Turn cancelled");
        Some(ended)
    }

    /// Derived plan and tool-call view of the conversation's latest turn
    pub fn snapshot(&self, conversation_id: &str) -> Option<ExtractedView> {
        let is_streaming = self.engine.streams().lock().is_streaming(conversation_id);
        let store = self.engine.store().lock();
        let conv = store.get_conversation(conversation_id)?;
        Some(extract(conv.events(), is_streaming))
    }
}
