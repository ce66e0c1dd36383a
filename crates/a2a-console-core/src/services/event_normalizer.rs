//! Turns raw A2A protocol messages into display-ready [`Event`]s.
//!
//! Accepts JSON-RPC envelopes (`{"result": {...}}` / `{"error": {...}}`) or
//! bare result objects. Shapes that are not recognised yield `None` so the
//! stream keeps flowing when the protocol grows new message kinds.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::trace;

use crate::models::event::join_text_parts;
use crate::models::{Artifact, Event, EventType, Part};

/// Artifact names that carry the execution plan
pub const PLAN_ARTIFACT_NAMES: [&str; 3] = [
    "execution_plan",
    "execution_plan_update",
    "execution_plan_status_update",
];

pub const TOOL_START_ARTIFACT: &str = "tool_notification_start";
pub const TOOL_END_ARTIFACT: &str = "tool_notification_end";

pub fn is_plan_artifact(name: &str) -> bool {
    PLAN_ARTIFACT_NAMES.contains(&name)
}

/// Stateful wrapper that stamps ids and turn-monotonic timestamps
#[derive(Debug, Default)]
pub struct EventNormalizer {
    last_timestamp: Option<DateTime<Utc>>,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new turn; timestamps only need to be monotonic within a turn
    pub fn begin_turn(&mut self) {
        self.last_timestamp = None;
    }

    pub fn normalize(&mut self, raw: Value) -> Option<Event> {
        let draft = classify(&raw)?;
        Some(Event {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            timestamp: self.next_timestamp(),
            event_type: draft.event_type,
            display_name: draft.display_name,
            display_content: draft.display_content,
            task_id: draft.task_id,
            context_id: draft.context_id,
            source_agent: draft.source_agent,
            artifact: draft.artifact,
            status: draft.status,
            raw,
        })
    }

    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(stamp);
        stamp
    }
}

/// A `message` event sent by an agent rather than echoed from the user
pub fn is_agent_message(event: &Event) -> bool {
    if event.event_type != EventType::Message {
        return false;
    }
    let body = event.raw.get("result").unwrap_or(&event.raw);
    str_at(body, "role") != Some("user")
}

/// Everything about an event that depends only on the raw message
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub display_name: String,
    pub display_content: String,
    pub task_id: Option<String>,
    pub context_id: Option<String>,
    pub source_agent: Option<String>,
    pub artifact: Option<Artifact>,
    pub status: Option<String>,
}

/// Classify a raw protocol message. Pure.
pub fn classify(raw: &Value) -> Option<EventDraft> {
    if let Some(error) = raw.get("error").filter(|e| e.is_object()) {
        let message = str_at(error, "message").unwrap_or("Unknown error");
        return Some(EventDraft {
            event_type: EventType::Error,
            display_name: "Error".to_string(),
            display_content: message.to_string(),
            task_id: None,
            context_id: None,
            source_agent: None,
            artifact: None,
            status: Some("failed".to_string()),
        });
    }

    let body = raw.get("result").unwrap_or(raw);
    let kind = str_at(body, "kind").or_else(|| str_at(body, "type"))?;

    let draft = match kind {
        "task" => task_draft(body),
        "status-update" | "status_update" => status_draft(body),
        "artifact-update" | "artifact_update" => artifact_draft(body)?,
        "message" => message_draft(body)?,
        other => {
            trace!(kind = other, "Dropping unknown protocol message");
            return None;
        }
    };
    Some(draft)
}

fn task_draft(body: &Value) -> EventDraft {
    let state = body.get("status").and_then(|s| str_at(s, "state"));
    EventDraft {
        event_type: EventType::Task,
        display_name: match state {
            Some(state) => format!("Task {}", state),
            None => "Task".to_string(),
        },
        display_content: status_text(body),
        task_id: str_at(body, "id")
            .or_else(|| str_at(body, "taskId"))
            .map(str::to_string),
        context_id: str_at(body, "contextId").map(str::to_string),
        source_agent: source_agent(body, None),
        artifact: None,
        status: state.map(str::to_string),
    }
}

fn status_draft(body: &Value) -> EventDraft {
    let state = body
        .get("status")
        .and_then(|s| str_at(s, "state"))
        .unwrap_or("unknown");
    let failed = matches!(state, "failed" | "rejected");
    EventDraft {
        event_type: if failed {
            EventType::Error
        } else {
            EventType::Status
        },
        display_name: format!("Status: {}", state),
        display_content: status_text(body),
        task_id: str_at(body, "taskId").map(str::to_string),
        context_id: str_at(body, "contextId").map(str::to_string),
        source_agent: source_agent(body, None),
        artifact: None,
        status: Some(state.to_string()),
    }
}

fn artifact_draft(body: &Value) -> Option<EventDraft> {
    let raw_artifact = body.get("artifact")?;
    let name = str_at(raw_artifact, "name").unwrap_or("artifact").to_string();
    let artifact = Artifact {
        description: str_at(raw_artifact, "description").map(str::to_string),
        parts: parse_parts(raw_artifact.get("parts")),
        name,
    };

    let (event_type, display_name) = if is_plan_artifact(&artifact.name) {
        (EventType::ExecutionPlan, "Execution Plan".to_string())
    } else if artifact.name == TOOL_START_ARTIFACT {
        (EventType::ToolStart, "Tool started".to_string())
    } else if artifact.name == TOOL_END_ARTIFACT {
        (EventType::ToolEnd, "Tool completed".to_string())
    } else {
        (EventType::Artifact, artifact.name.clone())
    };

    Some(EventDraft {
        event_type,
        display_name,
        display_content: artifact.text(),
        task_id: str_at(body, "taskId").map(str::to_string),
        context_id: str_at(body, "contextId").map(str::to_string),
        source_agent: source_agent(body, Some(raw_artifact)),
        status: body
            .get("status")
            .and_then(|s| str_at(s, "state").or_else(|| s.as_str()))
            .map(str::to_string),
        artifact: Some(artifact),
    })
}

fn message_draft(body: &Value) -> Option<EventDraft> {
    let parts = parse_parts(body.get("parts"));
    if parts.is_empty() {
        return None;
    }
    Some(EventDraft {
        event_type: EventType::Message,
        display_name: match str_at(body, "role") {
            Some("user") => "User message".to_string(),
            _ => "Agent message".to_string(),
        },
        display_content: join_text_parts(&parts),
        task_id: str_at(body, "taskId").map(str::to_string),
        context_id: str_at(body, "contextId").map(str::to_string),
        source_agent: source_agent(body, None),
        artifact: None,
        status: None,
    })
}

fn status_text(body: &Value) -> String {
    body.get("status")
        .and_then(|s| s.get("message"))
        .map(|m| join_text_parts(&parse_parts(m.get("parts"))))
        .unwrap_or_default()
}

fn source_agent(body: &Value, artifact: Option<&Value>) -> Option<String> {
    const KEYS: [&str; 3] = ["sourceAgent", "source_agent", "agent_name"];
    let metadata = [artifact.and_then(|a| a.get("metadata")), body.get("metadata")];
    metadata
        .into_iter()
        .flatten()
        .find_map(|meta| KEYS.iter().find_map(|key| str_at(meta, key)))
        .map(str::to_string)
}

/// Parse protocol parts, accepting `kind` or the older `type` tag
fn parse_parts(parts: Option<&Value>) -> Vec<Part> {
    let Some(parts) = parts.and_then(Value::as_array) else {
        return Vec::new();
    };
    parts
        .iter()
        .filter_map(|part| {
            let kind = str_at(part, "kind").or_else(|| str_at(part, "type"))?;
            match kind {
                "text" => Some(Part::Text {
                    text: str_at(part, "text")?.to_string(),
                }),
                "data" => Some(Part::Data {
                    data: part.get("data")?.clone(),
                }),
                "file" => {
                    let file = part.get("file").unwrap_or(part);
                    Some(Part::File {
                        name: str_at(file, "name").map(str::to_string),
                        mime_type: str_at(file, "mimeType").map(str::to_string),
                        uri: str_at(file, "uri").map(str::to_string),
                    })
                }
                _ => None,
            }
        })
        .collect()
}

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
