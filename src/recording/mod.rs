//! Event recording
//!
//! What this module provides
//! - The mapping from raw handler output (`RunItem`) to the append-only,
//!   observer-facing event log (`AgentEvent`)
//!
//! Exports
//! - Models
//!   - `EventKind::{Message, Handoff, ToolCall, ToolOutput, ContextUpdate}`,
//!     serialized as `message`, `handoff`, `tool_call`, `tool_output`, `context_update`
//!   - `AgentEvent { id, type, agent, content, metadata?, timestamp }`
//! - Services
//!   - `EventRecorder::record(&[RunItem]) -> Vec<AgentEvent>`
//! - Utils
//!   - `truncate(text, limit)`, `truncate_value(value, limit)`, `now_ms()`
//!
//! Implementation strategy
//! - Truncation is lossy and deliberate: any string longer than the limit keeps
//!   its first `limit` characters followed by `…`. Metadata values are
//!   truncated leaf by leaf, so their shape is preserved
//! - A handoff over an edge with a hydration callback produces two events:
//!   the `handoff` itself (by the source) and a synthesized `tool_call` naming
//!   the callback (by the target)
//!
//! Testing strategy
//! - Unit tests per item kind; property tests for truncation bounds

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::items::RunItem;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// Keep at most `limit` characters, marking cut text with `…`.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// Truncate every string inside `value`.
pub fn truncate_value(value: &Value, limit: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s, limit)),
        Value::Array(items) => Value::Array(items.iter().map(|v| truncate_value(v, limit)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_value(v, limit)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Handoff,
    ToolCall,
    ToolOutput,
    ContextUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub agent: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: f64,
}

impl AgentEvent {
    pub fn new(kind: EventKind, agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            kind,
            agent: agent.into(),
            content: content.into(),
            metadata: None,
            timestamp: now_ms(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Converts run items into events.
#[derive(Debug, Clone, Copy)]
pub struct EventRecorder {
    limit: usize,
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self { limit: 200 }
    }
}

impl EventRecorder {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn record(&self, items: &[RunItem]) -> Vec<AgentEvent> {
        let mut events = Vec::with_capacity(items.len());
        for item in items {
            self.record_item(item, &mut events);
        }
        events
    }

    fn record_item(&self, item: &RunItem, out: &mut Vec<AgentEvent>) {
        match item {
            RunItem::Message { handler, text } => {
                out.push(self.message(handler, text));
            }
            RunItem::Handoff {
                source,
                target,
                hydration,
            } => {
                out.push(
                    AgentEvent::new(EventKind::Handoff, source, format!("{source} -> {target}"))
                        .with_metadata(json!({"source_agent": source, "target_agent": target})),
                );
                if let Some(callback) = hydration {
                    out.push(AgentEvent::new(EventKind::ToolCall, target, callback));
                }
            }
            RunItem::ToolCall {
                handler,
                tool,
                arguments,
            } => out.push(
                AgentEvent::new(EventKind::ToolCall, handler, truncate(tool, self.limit))
                    .with_metadata(json!({"tool_args": truncate_value(arguments, self.limit)})),
            ),
            RunItem::ToolOutput {
                handler,
                tool: _,
                output,
            } => {
                let text = match output {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push(
                    AgentEvent::new(EventKind::ToolOutput, handler, truncate(&text, self.limit))
                        .with_metadata(json!({"tool_result": truncate_value(output, self.limit)})),
                );
            }
        }
    }

    /// Assistant message event.
    pub fn message(&self, agent: &str, text: &str) -> AgentEvent {
        AgentEvent::new(EventKind::Message, agent, truncate(text, self.limit))
    }

    /// Event carrying only the changed public-context keys, strings truncated.
    pub fn context_update(&self, agent: &str, changes: Map<String, Value>) -> AgentEvent {
        let changes = truncate_value(&Value::Object(changes), self.limit);
        AgentEvent::new(EventKind::ContextUpdate, agent, "")
            .with_metadata(json!({ "changes": changes }))
    }
}
