//! Projection of a turn's events into an execution plan and tool-call
//! lifecycles.
//!
//! Pure and idempotent: the same events always give the same view, and the
//! view is never written back anywhere.
//!
//! Plan lines follow a closed grammar, `<glyph> [<agent>] <description>`:
//!
//! | glyph   | status        |
//! |---------|---------------|
//! | ✅      | `completed`   |
//! | 🔄 / ⏳ | `in_progress` |
//! | ❌      | `failed`      |
//! | ⬜      | `pending`     |
//!
//! Lines with any other glyph are ignored.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use super::event_normalizer::is_plan_artifact;
use crate::models::{Event, EventType};

/// Characters of the description used to recognise a repeated task
const TASK_KEY_PREFIX_CHARS: usize = 40;

lazy_static! {
    static ref PLAN_LINE_REGEX: Regex = Regex::new(
        r"^\s*(?:[-*]\s*)?(✅|🔄|⏳|❌|⬜)\x{FE0F}?\s*\[([^\]]+)\]\s*(.+?)\s*$"
    )
    .expect("PLAN_LINE_REGEX pattern is valid");

    static ref TOOL_NAME_REGEX: Regex = Regex::new(
        r"(?i)(?:tool(?:\s+call)?(?:\s+(?:started|completed|finished))?\s*[:\-]|calling(?:\s+tool)?\s*:?)\s*`?([A-Za-z_][A-Za-z0-9_.\-]*)"
    )
    .expect("TOOL_NAME_REGEX pattern is valid");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    fn from_glyph(glyph: &str) -> Option<Self> {
        match glyph {
            "✅" => Some(TaskStatus::Completed),
            "🔄" | "⏳" => Some(TaskStatus::InProgress),
            "❌" => Some(TaskStatus::Failed),
            "⬜" => Some(TaskStatus::Pending),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutionTask {
    pub id: String,
    pub agent: String,
    pub description: String,
    pub status: TaskStatus,
    /// Order of first appearance, starting at 0
    pub order: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolCall {
    /// Id of the `tool_start` event
    pub id: String,
    pub tool_name: String,
    pub agent: Option<String>,
    pub status: ToolCallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExtractedView {
    pub execution_tasks: Vec<ExecutionTask>,
    pub active_tool_calls: Vec<ToolCall>,
    pub completed_tool_calls: Vec<ToolCall>,
}

impl ExtractedView {
    pub fn is_empty(&self) -> bool {
        self.execution_tasks.is_empty()
            && self.active_tool_calls.is_empty()
            && self.completed_tool_calls.is_empty()
    }
}

/// Derive the plan and tool-call view of one turn.
///
/// When `is_streaming` is false nothing is left running: in-progress tasks
/// and unmatched tool starts are reported as completed.
pub fn extract(events: &[Event], is_streaming: bool) -> ExtractedView {
    let mut execution_tasks = extract_tasks(events);
    let (mut active_tool_calls, mut completed_tool_calls) = extract_tool_calls(events);

    if !is_streaming {
        for task in &mut execution_tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Completed;
            }
        }
        for mut call in active_tool_calls.drain(..) {
            call.status = ToolCallStatus::Completed;
            completed_tool_calls.push(call);
        }
    }

    ExtractedView {
        execution_tasks,
        active_tool_calls,
        completed_tool_calls,
    }
}

fn is_plan_event(event: &Event) -> bool {
    matches!(event.event_type, EventType::Artifact | EventType::ExecutionPlan)
        && event.artifact_name().is_some_and(is_plan_artifact)
}

fn extract_tasks(events: &[Event]) -> Vec<ExecutionTask> {
    let mut tasks: Vec<ExecutionTask> = Vec::new();
    let mut index_by_key: HashMap<(String, String), usize> = HashMap::new();

    for event in events.iter().filter(|e| is_plan_event(e)) {
        let text = match &event.artifact {
            Some(artifact) if !artifact.text().is_empty() => artifact.text(),
            _ => event.display_content.clone(),
        };

        for line in text.lines() {
            let Some((status, agent, description)) = parse_plan_line(line) else {
                continue;
            };
            let key = task_key(&agent, &description);
            match index_by_key.get(&key) {
                Some(&index) => {
                    let task = &mut tasks[index];
                    task.status = status;
                    task.description = description;
                }
                None => {
                    let order = tasks.len();
                    index_by_key.insert(key, order);
                    tasks.push(ExecutionTask {
                        id: format!("task-{}", order),
                        agent,
                        description,
                        status,
                        order,
                    });
                }
            }
        }
    }
    tasks
}

/// Parse one plan line into `(status, agent, description)`
pub fn parse_plan_line(line: &str) -> Option<(TaskStatus, String, String)> {
    let caps = PLAN_LINE_REGEX.captures(line)?;
    let status = TaskStatus::from_glyph(caps.get(1)?.as_str())?;
    let agent = caps.get(2)?.as_str().trim().to_string();
    let description = caps.get(3)?.as_str().to_string();
    Some((status, agent, description))
}

fn task_key(agent: &str, description: &str) -> (String, String) {
    let prefix: String = description
        .chars()
        .take(TASK_KEY_PREFIX_CHARS)
        .collect::<String>()
        .to_lowercase();
    (agent.to_lowercase(), prefix)
}

fn extract_tool_calls(events: &[Event]) -> (Vec<ToolCall>, Vec<ToolCall>) {
    // Unmatched starts per tool name, oldest first, tagged with arrival order
    let mut open: HashMap<String, VecDeque<(usize, ToolCall)>> = HashMap::new();
    let mut completed = Vec::new();

    for (seq, event) in events.iter().enumerate() {
        match event.event_type {
            EventType::ToolStart => {
                let tool_name = tool_name(event).unwrap_or_else(|| "unknown".to_string());
                let call = ToolCall {
                    id: event.id.clone(),
                    tool_name: tool_name.clone(),
                    agent: event.source_agent.clone(),
                    status: ToolCallStatus::Running,
                    started_at: event.timestamp,
                    ended_at: None,
                };
                open.entry(tool_name).or_default().push_back((seq, call));
            }
            EventType::ToolEnd => {
                let Some(name) = tool_name(event) else {
                    continue;
                };
                if let Some((_, mut call)) = open.get_mut(&name).and_then(VecDeque::pop_front) {
                    call.status = ToolCallStatus::Completed;
                    call.ended_at = Some(event.timestamp);
                    completed.push(call);
                }
            }
            _ => {}
        }
    }

    let mut active: Vec<(usize, ToolCall)> = open.into_values().flatten().collect();
    active.sort_by_key(|(seq, _)| *seq);
    (active.into_iter().map(|(_, call)| call).collect(), completed)
}

/// Tool name from the structured description, a data part, or the display text
pub fn tool_name(event: &Event) -> Option<String> {
    let artifact = event.artifact.as_ref();

    let from_description = artifact
        .and_then(|a| a.description.as_deref())
        .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok())
        .and_then(|v| name_field(&v));
    if from_description.is_some() {
        return from_description;
    }

    let from_data = artifact.and_then(|a| a.data()).and_then(name_field);
    if from_data.is_some() {
        return from_data;
    }

    let free_text = artifact
        .and_then(|a| a.description.as_deref())
        .into_iter()
        .chain(std::iter::once(event.display_content.as_str()));
    for text in free_text {
        if let Some(caps) = TOOL_NAME_REGEX.captures(text) {
            return caps.get(1).map(|m| m.as_str().to_string());
        }
    }
    None
}

fn name_field(value: &serde_json::Value) -> Option<String> {
    ["tool_name", "tool", "name"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
