//! Items representing conversation history and raw execution output
//!
//! `InputItem` is what handlers see as history. `RunItem` is what one handler
//! step produced; the recorder turns run items into observer-facing events.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One entry of a thread's ordered input history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputItem {
    pub role: Role,
    pub content: String,
    /// Producing handler for assistant items, tool name for tool items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl InputItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(handler: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: Some(handler.into()),
        }
    }

    pub fn tool(tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: Some(tool.into()),
        }
    }
}

/// A tool invocation requested by a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCallRequest {
    /// Tool name from the handler's capability set
    pub name: String,
    /// JSON object matching the tool's parameter schema
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// A request to hand control to another handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HandoffRequest {
    /// Registered name of the target handler
    pub target: String,
}

/// Raw output of one handler step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum RunItem {
    Message {
        handler: String,
        text: String,
    },
    Handoff {
        source: String,
        target: String,
        /// Hydration callback attached to the traversed edge
        hydration: Option<String>,
    },
    ToolCall {
        handler: String,
        tool: String,
        arguments: Value,
    },
    ToolOutput {
        handler: String,
        tool: String,
        output: Value,
    },
}

impl RunItem {
    /// Handler that produced the item; for handoffs, the source.
    pub fn handler(&self) -> &str {
        match self {
            RunItem::Message { handler, .. }
            | RunItem::ToolCall { handler, .. }
            | RunItem::ToolOutput { handler, .. } => handler,
            RunItem::Handoff { source, .. } => source,
        }
    }
}
