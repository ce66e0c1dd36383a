pub mod event_normalizer;
pub mod plan_extractor;
pub mod sync_engine;

pub use event_normalizer::{EventDraft, EventNormalizer, classify, is_agent_message, is_plan_artifact};
pub use plan_extractor::{
    ExecutionTask, ExtractedView, TaskStatus, ToolCall, ToolCallStatus, extract,
};
pub use sync_engine::{LoadOutcome, ReconcileOutcome, SaveReport, SyncEngine};
