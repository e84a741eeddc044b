//! Conversation state and thread stores
//!
//! What this module provides
//! - The per-thread record the turn loop mutates, the snapshot observers see,
//!   and the load/save interface threads are persisted through
//!
//! Exports
//! - Models
//!   - `ConversationState { thread_id, history, context, current_handler, events, guardrail_checks }`
//!   - `Snapshot { thread_id, current_handler, context, handlers, events, guardrail_checks }`
//! - Traits
//!   - `ThreadStore`: `load(id) -> Option<ConversationState>`, `save(&state)`, `generate_id()`
//!   - Implementations: `InMemoryThreadStore`, `SqliteThreadStore` (see `sqlite_session`)
//!
//! Implementation strategy
//! - A snapshot never carries the raw context; it is built from
//!   `SharedContext::public_view`
//! - The store hands out clones; the server owns the only live copy of a
//!   thread while a turn runs and saves it back when the turn ends
//!
//! Testing strategy
//! - Unit tests for snapshot shape and store round trips

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::SharedContext;
use crate::error::{Result, TriageError};
use crate::guardrail::GuardrailCheck;
use crate::handoff::{HandlerDescriptor, HandlerRegistry};
use crate::items::InputItem;
use crate::recording::AgentEvent;

/// Everything known about one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    pub history: Vec<InputItem>,
    pub context: SharedContext,
    pub current_handler: String,
    pub events: Vec<AgentEvent>,
    /// Gate results of the most recent turn
    pub guardrail_checks: Vec<GuardrailCheck>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>, entry_handler: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            history: Vec::new(),
            context: SharedContext::default(),
            current_handler: entry_handler.into(),
            events: Vec::new(),
            guardrail_checks: Vec::new(),
        }
    }
}

/// Observer-facing picture of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub thread_id: String,
    pub current_handler: String,
    pub context: Map<String, Value>,
    pub handlers: Vec<HandlerDescriptor>,
    pub events: Vec<AgentEvent>,
    pub guardrail_checks: Vec<GuardrailCheck>,
}

impl Snapshot {
    pub fn capture(state: &ConversationState, registry: &HandlerRegistry) -> Self {
        Self {
            thread_id: state.thread_id.clone(),
            current_handler: state.current_handler.clone(),
            context: state.context.public_view(),
            handlers: registry.descriptors(),
            events: state.events.clone(),
            guardrail_checks: state.guardrail_checks.clone(),
        }
    }
}

/// Persistence boundary for threads.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>>;

    async fn save(&self, state: &ConversationState) -> Result<()>;

    fn generate_id(&self) -> String {
        format!("thr_{}", Uuid::new_v4().simple())
    }
}

/// Process-local thread store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryThreadStore {
    inner: Arc<Mutex<HashMap<String, ConversationState>>>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| TriageError::Store("thread store lock poisoned".into()))?;
        Ok(guard.get(thread_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| TriageError::Store("thread store lock poisoned".into()))?;
        guard.insert(state.thread_id.clone(), state.clone());
        Ok(())
    }
}
