pub mod conversation;
pub mod conversations_store;
pub mod event;
pub mod message;
pub mod runs_store;
pub mod stream_manager;

pub use conversation::{Conversation, DEFAULT_TITLE, derive_title};
pub use conversations_store::{
    ConversationsStore, EVICTION_PREVIEW_CHARS, ReconcileSummary, RemoteConversation, SharedStore,
};
pub use event::{Artifact, Event, EventType, Part};
pub use message::{Feedback, FeedbackKind, Message, MessagePatch, Role};
pub use runs_store::RunsStore;
pub use stream_manager::{
    EndedSession, SessionPhase, SharedStreams, StreamHandle, StreamManager, StreamStatus,
};
