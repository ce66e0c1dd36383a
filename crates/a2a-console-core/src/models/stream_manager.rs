use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub type SharedStreams = Arc<Mutex<StreamManager>>;

/// How a streaming session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Completed,
    Cancelled,
}

/// Per-conversation session phase.
///
/// `Idle` is represented by absence from the manager. `Settling` covers the
/// window between the end of a stream and its debounced save, during which
/// the conversation may still be unknown to the remote store.
#[derive(Clone, Debug)]
pub enum SessionPhase {
    Streaming {
        message_id: String,
        turn_id: String,
        cancel_flag: Arc<AtomicBool>,
        started_at: Instant,
    },
    Settling {
        message_id: String,
        turn_id: String,
        status: StreamStatus,
    },
}

/// Returned when a session leaves `Streaming`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndedSession {
    pub conversation_id: String,
    pub message_id: String,
    pub turn_id: String,
    pub status: StreamStatus,
}

/// Transport-side view of a session: the flag flips when the user cancels
#[derive(Clone, Debug)]
pub struct StreamHandle {
    cancel_flag: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }
}

/// Tracks which conversations have a live generation in flight.
///
/// Owns cancellation; does not hold message content, which lives only in
/// the conversations store.
pub struct StreamManager {
    sessions: HashMap<String, SessionPhase>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn into_shared(self) -> SharedStreams {
        Arc::new(Mutex::new(self))
    }

    /// Enter `Streaming`. An existing stream for the conversation is
    /// cancelled first.
    pub fn begin(&mut self, conv_id: &str, message_id: &str, turn_id: &str) -> StreamHandle {
        if let Some(SessionPhase::Streaming { cancel_flag, .. }) = self.sessions.remove(conv_id) {
            cancel_flag.store(true, Ordering::Relaxed);
            debug!(conv_id = %conv_id, "Cancelled existing stream before starting a new one");
        }

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.sessions.insert(
            conv_id.to_string(),
            SessionPhase::Streaming {
                message_id: message_id.to_string(),
                turn_id: turn_id.to_string(),
                cancel_flag: cancel_flag.clone(),
                started_at: Instant::now(),
            },
        );
        debug!(conv_id = %conv_id, message_id = %message_id, "Stream started");
        StreamHandle { cancel_flag }
    }

    /// Natural completion: `Streaming` → `Settling`
    pub fn finish(&mut self, conv_id: &str) -> Option<EndedSession> {
        self.end(conv_id, StreamStatus::Completed)
    }

    /// User cancellation: signals the transport, then `Streaming` → `Settling`
    pub fn cancel(&mut self, conv_id: &str) -> Option<EndedSession> {
        self.end(conv_id, StreamStatus::Cancelled)
    }

    fn end(&mut self, conv_id: &str, status: StreamStatus) -> Option<EndedSession> {
        let Some(SessionPhase::Streaming {
            message_id,
            turn_id,
            cancel_flag,
            started_at,
        }) = self.sessions.remove(conv_id)
        else {
            warn!(conv_id = %conv_id, ?status, "No streaming session to end");
            return None;
        };

        if status == StreamStatus::Cancelled {
            cancel_flag.store(true, Ordering::Relaxed);
        }

        debug!(
            conv_id = %conv_id,
            ?status,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Stream ended"
        );

        self.sessions.insert(
            conv_id.to_string(),
            SessionPhase::Settling {
                message_id: message_id.clone(),
                turn_id: turn_id.clone(),
                status,
            },
        );

        Some(EndedSession {
            conversation_id: conv_id.to_string(),
            message_id,
            turn_id,
            status,
        })
    }

    /// `Settling` → `Idle`, once the post-stream save has run
    pub fn settle(&mut self, conv_id: &str) {
        if matches!(self.sessions.get(conv_id), Some(SessionPhase::Settling { .. })) {
            self.sessions.remove(conv_id);
        }
    }

    pub fn phase(&self, conv_id: &str) -> Option<&SessionPhase> {
        self.sessions.get(conv_id)
    }

    pub fn is_streaming(&self, conv_id: &str) -> bool {
        matches!(self.sessions.get(conv_id), Some(SessionPhase::Streaming { .. }))
    }

    /// Message id and turn id of the in-flight assistant message
    pub fn active_message(&self, conv_id: &str) -> Option<(&str, &str)> {
        match self.sessions.get(conv_id) {
            Some(SessionPhase::Streaming {
                message_id,
                turn_id,
                ..
            }) => Some((message_id.as_str(), turn_id.as_str())),
            _ => None,
        }
    }

    /// Turn whose local messages are newer than the remote copy: the
    /// streaming turn, or the ended turn still waiting for its save
    pub fn unsaved_turn(&self, conv_id: &str) -> Option<&str> {
        match self.sessions.get(conv_id) {
            Some(SessionPhase::Streaming { turn_id, .. })
            | Some(SessionPhase::Settling { turn_id, .. }) => Some(turn_id.as_str()),
            None => None,
        }
    }

    /// Conversations that must survive list reconciliation: streaming, or
    /// ended but not yet saved
    pub fn held_conversations(&self) -> HashSet<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn has_active_streams(&self) -> bool {
        self.sessions
            .values()
            .any(|phase| matches!(phase, SessionPhase::Streaming { .. }))
    }

    /// Drop a conversation's session whatever its phase, signalling the
    /// transport if it was still streaming
    pub fn forget(&mut self, conv_id: &str) {
        if let Some(SessionPhase::Streaming { cancel_flag, .. }) = self.sessions.remove(conv_id) {
            cancel_flag.store(true, Ordering::Relaxed);
        }
    }

    /// Cancel every live stream (shutdown)
    pub fn stop_all(&mut self) -> Vec<EndedSession> {
        let streaming: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, phase)| matches!(phase, SessionPhase::Streaming { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        streaming
            .iter()
            .filter_map(|id| self.cancel(id))
            .collect()
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}
