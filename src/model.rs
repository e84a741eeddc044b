//! Handler decision process
//!
//! One handler step is one call to a [`HandlerModel`]: given the handler's
//! instructions, its tools, where it may hand off to, the shared context and
//! the conversation history, decide what to do next. The answer is a
//! [`HandlerDecision`]: optional tool calls, an optional final message and an
//! optional handoff.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::SharedContext;
use crate::error::{Result, TriageError};
use crate::handoff::Handler;
use crate::items::{HandoffRequest, InputItem, Role, ToolCallRequest};
use crate::provider::{ModelTier, SharedCompletion};
use crate::tool::ToolSpec;

/// What a handler decided to do in one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HandlerDecision {
    /// Reply to the customer; ends the turn unless a handoff is also requested
    #[serde(default)]
    pub message: Option<String>,
    /// Tools to run, in order, before anything else
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Hand control to another handler
    #[serde(default)]
    pub handoff: Option<HandoffRequest>,
}

impl HandlerDecision {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn call(tool: impl Into<String>, arguments: Value) -> Self {
        Self::default().with_tool_call(tool, arguments)
    }

    pub fn handoff(target: impl Into<String>) -> Self {
        Self::default().with_handoff(target)
    }

    pub fn with_tool_call(mut self, tool: impl Into<String>, arguments: Value) -> Self {
        self.tool_calls.push(ToolCallRequest::new(tool, arguments));
        self
    }

    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        self.message = Some(text.into());
        self
    }

    pub fn with_handoff(mut self, target: impl Into<String>) -> Self {
        self.handoff = Some(HandoffRequest {
            target: target.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.tool_calls.is_empty() && self.handoff.is_none()
    }
}

/// A handoff target as presented to the deciding handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub target: String,
    pub description: String,
}

/// Everything a handler model sees for one step.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub handler: Arc<Handler>,
    /// Instructions with context placeholders filled in
    pub instructions: String,
    pub tools: Vec<ToolSpec>,
    pub transitions: Vec<TransitionSpec>,
    pub context: SharedContext,
    pub history: Vec<InputItem>,
}

/// Decides a handler's next step.
#[async_trait]
pub trait HandlerModel: Send + Sync {
    async fn decide(&self, input: HandlerInput) -> Result<HandlerDecision>;
}

/// Decisions produced by the completion service.
#[derive(Debug, Clone)]
pub struct CompletionHandlerModel {
    completion: SharedCompletion,
}

impl CompletionHandlerModel {
    pub fn new(completion: SharedCompletion) -> Self {
        Self { completion }
    }

    fn system_prompt(input: &HandlerInput) -> String {
        let tools: Vec<Value> = input
            .tools
            .iter()
            .map(|t| json!({"name": t.name, "description": t.description, "parameters": t.parameters}))
            .collect();
        let transitions: Vec<Value> = input
            .transitions
            .iter()
            .map(|t| json!({"target": t.target, "description": t.description}))
            .collect();
        format!(
            "You are {name}. {instructions}\n\n\
             Tools you may call:\n{tools}\n\n\
             Handlers you may hand the conversation to:\n{transitions}\n\n\
             Known customer context:\n{context}\n\n\
             Respond with tool_calls to gather or change information, a message to answer \
             the customer, or a handoff when another handler is better suited.",
            name = input.handler.name,
            instructions = input.instructions,
            tools = Value::Array(tools),
            transitions = Value::Array(transitions),
            context = Value::Object(input.context.public_view()),
        )
    }

    fn transcript(history: &[InputItem]) -> String {
        history
            .iter()
            .map(|item| {
                let who = match (item.role, &item.name) {
                    (Role::User, _) => "customer".to_string(),
                    (Role::Assistant, Some(name)) => name.clone(),
                    (Role::Assistant, None) => "assistant".to_string(),
                    (Role::Tool, Some(name)) => format!("tool {name}"),
                    (Role::Tool, None) => "tool".to_string(),
                };
                format!("[{who}] {}", item.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl HandlerModel for CompletionHandlerModel {
    async fn decide(&self, input: HandlerInput) -> Result<HandlerDecision> {
        let system = Self::system_prompt(&input);
        let user = Self::transcript(&input.history);
        self.completion
            .complete_typed("handler_decision", system, user, ModelTier::Reasoning)
            .await
    }
}

/// What a scripted model was asked.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub handler: String,
    pub context: SharedContext,
    pub history_len: usize,
    pub tools: Vec<String>,
}

/// Replays queued decisions per handler and records every call.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHandlerModel {
    script: Arc<Mutex<HashMap<String, VecDeque<HandlerDecision>>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl ScriptedHandlerModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `decision` for the next step of `handler`.
    pub fn push(&self, handler: impl Into<String>, decision: HandlerDecision) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.entry(handler.into()).or_default().push_back(decision);
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn remaining(&self, handler: &str) -> usize {
        self.script
            .lock()
            .ok()
            .and_then(|s| s.get(handler).map(VecDeque::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl HandlerModel for ScriptedHandlerModel {
    async fn decide(&self, input: HandlerInput) -> Result<HandlerDecision> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                handler: input.handler.name.clone(),
                context: input.context.clone(),
                history_len: input.history.len(),
                tools: input.tools.iter().map(|t| t.name.clone()).collect(),
            });
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&input.handler.name).and_then(VecDeque::pop_front))
            .ok_or_else(|| TriageError::ModelBehavior {
                message: format!("no scripted decision left for {}", input.handler.name),
            })
    }
}
