//! Conversation memory for the confidence router

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TriageError};

/// One routed exchange, kept for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_input: String,
    pub agent_response: String,
    pub intent: String,
    pub confidence: f64,
    pub rewritten_prompt: String,
    /// Extracted entities by type; a repeated type keeps its last value
    pub entities: HashMap<String, String>,
    pub classification_reasoning: String,
    /// Only present when a tool ran
    pub tool_reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Defines the interface for router memory implementations.
#[async_trait]
pub trait MemoryStore: Send + Sync + Debug {
    /// Appends a turn to the session's history.
    async fn save_turn(&self, session_id: &str, turn: ConversationTurn) -> Result<()>;

    /// Turns of a session, oldest first.
    async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>>;

    /// Forgets a session.
    async fn clear(&self, session_id: &str) -> Result<()>;
}

/// Process-local memory keyed by session id.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMemoryStore {
    sessions: Arc<Mutex<HashMap<String, Vec<ConversationTurn>>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<ConversationTurn>>>> {
        self.sessions
            .lock()
            .map_err(|_| TriageError::Store("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn save_turn(&self, session_id: &str, turn: ConversationTurn) -> Result<()> {
        self.sessions()?
            .entry(session_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        Ok(self.sessions()?.get(session_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions()?.remove(session_id);
        Ok(())
    }
}
