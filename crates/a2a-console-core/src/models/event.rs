use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of event kinds the console understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Task,
    Artifact,
    ToolStart,
    ToolEnd,
    ExecutionPlan,
    Status,
    Error,
    Message,
}

impl EventType {
    pub fn is_tool(&self) -> bool {
        matches!(self, EventType::ToolStart | EventType::ToolEnd)
    }
}

/// One content part of an artifact or protocol message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Data {
        data: serde_json::Value,
    },
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Artifact {
    /// Concatenated text parts, newline separated
    pub fn text(&self) -> String {
        join_text_parts(&self.parts)
    }

    /// First structured data part, if any
    pub fn data(&self) -> Option<&serde_json::Value> {
        self.parts.iter().find_map(|part| match part {
            Part::Data { data } => Some(data),
            _ => None,
        })
    }
}

pub(crate) fn join_text_parts(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A normalized, display-ready record of one protocol step.
///
/// `raw` keeps the untouched protocol payload in memory only. It is never
/// serialized, so anything written to the remote store or exported carries
/// the display fields alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub display_name: String,
    #[serde(default)]
    pub display_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing)]
    pub raw: serde_json::Value,
}

impl Event {
    pub fn artifact_name(&self) -> Option<&str> {
        self.artifact.as_ref().map(|a| a.name.as_str())
    }

    /// Copy without the in-memory protocol payload
    pub fn without_raw(&self) -> Self {
        Self {
            raw: serde_json::Value::Null,
            ..self.clone()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Minimal event for store and engine tests
    pub(crate) fn event(id: &str) -> Event {
        typed(id, EventType::Status, "")
    }

    pub(crate) fn typed(id: &str, event_type: EventType, content: &str) -> Event {
        Event {
            id: id.to_string(),
            timestamp: Utc::now(),
            event_type,
            display_name: format!("{:?}", event_type),
            display_content: content.to_string(),
            task_id: None,
            context_id: None,
            source_agent: None,
            artifact: None,
            status: None,
            raw: serde_json::json!({"id": id}),
        }
    }
}
