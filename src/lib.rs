//! # Tower Triage
//!
//! A Tower-based conversational task router. Two ways to route a customer
//! message are provided:
//!
//! - **Handoff graph**: named handlers connected by explicit transitions. Each
//!   turn passes the message through the active handler's safety gates, then
//!   lets the handler call tools and hand off along registered edges until it
//!   replies or the step budget runs out. Every step lands in an append-only
//!   event log that is broadcast to subscribers as snapshot-plus-delta frames.
//! - **Confidence router**: a classifier scores the message against an intent
//!   catalogue and the router executes, asks for clarification, or falls back
//!   depending on the score.
//!
//! Model calls go through a single completion contract (`provider`), so the
//! OpenAI stack and deterministic fakes are interchangeable.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tower_triage::{airline, observability, InMemoryThreadStore, TriageConfig, TriageServer};
//!
//! # async fn example() -> tower_triage::Result<()> {
//! let config = TriageConfig::from_env()?;
//! let completion = observability::openai_stack(&config);
//! let runner = airline::build_runner(completion.clone(), completion, &config)?;
//! let server = TriageServer::new(runner, Arc::new(InMemoryThreadStore::new()), &config);
//!
//! let done = server.turn(None, "Can I change my seat?").await?;
//! println!("{:?}", done.outcome.assistant_message());
//! # Ok(())
//! # }
//! ```

pub mod airline;
pub mod config;
pub mod context;
pub mod error;
pub mod guardrail;
pub mod handoff;
pub mod items;
pub mod memory;
pub mod model;
pub mod observability;
pub mod provider;
pub mod recording;
pub mod resilience;
pub mod router;
pub mod runner;
pub mod server;
pub mod sessions;
pub mod sqlite_session;
pub mod streaming;
pub mod tool;

pub use config::{HandoffLimit, TriageConfig};
pub use context::SharedContext;
pub use error::{Result, TriageError};
pub use guardrail::{GateSet, SafetyGate};
pub use handoff::{Handler, HandlerRegistry, HydrationCallback};
pub use memory::{InMemoryMemoryStore, MemoryStore};
pub use model::{HandlerDecision, HandlerModel};
pub use provider::{ModelTier, SharedCompletion};
pub use recording::{AgentEvent, EventKind};
pub use router::{AgentResponse, ConfidenceRouter, IntentTool};
pub use runner::{TurnOutcome, TurnRunner};
pub use server::{TriageServer, TurnResult, TurnStreamItem};
pub use sessions::{ConversationState, InMemoryThreadStore, Snapshot, ThreadStore};
pub use sqlite_session::SqliteThreadStore;
pub use streaming::{Broadcaster, Subscription};
pub use tool::{tool_typed, Tool, ToolBox};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
