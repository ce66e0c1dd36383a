//! Conversation synchronization and live A2A event engine.
//!
//! Raw protocol messages flow through the [`services::EventNormalizer`] into the
//! [`models::ConversationsStore`]; the [`services::plan_extractor`] projects plans
//! and tool-call lifecycles out of the stored events; the
//! [`services::SyncEngine`] keeps the store in step with a [`repositories::RemoteStore`].
//! [`controllers::ConsoleController`] wires these together for a UI layer.

pub mod controllers;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

pub use controllers::ConsoleController;
pub use models::{
    Conversation, ConversationsStore, Event, EventType, Message, Role, SharedStore, StreamManager,
};
pub use repositories::{RemoteStore, RepositoryError, RepositoryResult};
pub use services::{EventNormalizer, SyncEngine};
pub use settings::SyncSettings;
