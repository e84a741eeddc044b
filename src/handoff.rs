//! # Handler Registry & Handoff Graph
//!
//! Handlers are the specialists a conversation can be routed to. Each has a
//! stable name, a description, the tools it may call, the safety gates every
//! inbound message must pass while it is active, and the set of handlers it may
//! hand control to.
//!
//! Handlers never hold references to one another. A [`Transition`] names its
//! source and target, plus an optional [`HydrationCallback`] that prepares the
//! shared context before the target's first step. The graph may contain cycles
//! (every specialist can usually return to triage).
//!
//! The registry is built once at startup and is read-only afterwards, so it can
//! be shared behind an `Arc` without locking.
//!
//! ```rust
//! use tower_triage::handoff::{Handler, HandlerRegistry, HydrationCallback};
//!
//! let mut registry = HandlerRegistry::new(
//!     Handler::new("Triage", "Routes the customer to a specialist"),
//! );
//! registry
//!     .register(Handler::new("Seats", "Changes seat assignments").with_tool("update_seat"))
//!     .unwrap();
//! registry
//!     .register_transition(
//!         "Triage",
//!         "Seats",
//!         Some(HydrationCallback::new("load_booking", |ctx| {
//!             ctx.seat_number.get_or_insert_with(|| "14C".to_string());
//!         })),
//!     )
//!     .unwrap();
//!
//! assert!(registry.is_valid_transition("Triage", "Seats"));
//! assert!(!registry.is_valid_transition("Seats", "Triage"));
//! assert_eq!(registry.resolve("nobody").name, "Triage");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::SharedContext;
use crate::error::{Result, TriageError};

type HydrationFn = dyn Fn(&mut SharedContext) + Send + Sync;

/// Named context mutation attached to a transition.
///
/// The name is part of the observable event log: traversing the edge records a
/// `tool_call` event whose content is this name.
#[derive(Clone)]
pub struct HydrationCallback {
    name: String,
    apply: Arc<HydrationFn>,
}

impl HydrationCallback {
    pub fn new(
        name: impl Into<String>,
        apply: impl Fn(&mut SharedContext) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, ctx: &mut SharedContext) {
        (self.apply)(ctx)
    }
}

impl fmt::Debug for HydrationCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HydrationCallback")
            .field("name", &self.name)
            .finish()
    }
}

/// A registered edge of the handoff graph.
#[derive(Debug, Clone)]
pub struct Transition {
    pub source: String,
    pub target: String,
    pub hydration: Option<HydrationCallback>,
}

/// A specialist the conversation can be routed to.
#[derive(Debug, Clone)]
pub struct Handler {
    pub name: String,
    pub description: String,
    /// Prompt template; `{confirmation}`, `{flight}`, `{seat}` and `{case_id}`
    /// are filled from the shared context at call time.
    pub instructions: String,
    /// Capability set: names of tools this handler may call
    pub tools: Vec<String>,
    /// Gates every inbound message must pass while this handler is active
    pub required_gates: Vec<String>,
}

impl Handler {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: String::new(),
            tools: Vec::new(),
            required_gates: Vec::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_gate(mut self, gate: impl Into<String>) -> Self {
        self.required_gates.push(gate.into());
        self
    }

    pub fn can_use(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }

    /// Instructions with context placeholders substituted.
    pub fn render_instructions(&self, ctx: &SharedContext) -> String {
        let unknown = "[unknown]";
        let fill = |v: &Option<String>| v.as_deref().unwrap_or(unknown).to_string();
        self.instructions
            .replace("{confirmation}", &fill(&ctx.confirmation_number))
            .replace("{flight}", &fill(&ctx.flight_number))
            .replace("{seat}", &fill(&ctx.seat_number))
            .replace("{case_id}", &fill(&ctx.compensation_case_id))
    }
}

/// Observer-facing description of a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub name: String,
    pub description: String,
    pub tools: Vec<String>,
    pub transitions: Vec<String>,
    pub required_gates: Vec<String>,
}

/// Name-indexed handlers plus the directed handoff graph.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    entry: String,
    order: Vec<String>,
    handlers: HashMap<String, Arc<Handler>>,
    edges: HashMap<String, Vec<Transition>>,
}

impl HandlerRegistry {
    /// Create a registry whose entry point is `entry`.
    pub fn new(entry: Handler) -> Self {
        let name = entry.name.clone();
        let mut handlers = HashMap::new();
        handlers.insert(name.clone(), Arc::new(entry));
        Self {
            entry: name.clone(),
            order: vec![name],
            handlers,
            edges: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Handler) -> Result<()> {
        if self.handlers.contains_key(&handler.name) {
            return Err(TriageError::Registry(format!(
                "handler '{}' is already registered",
                handler.name
            )));
        }
        debug!("registered handler {}", handler.name);
        self.order.push(handler.name.clone());
        self.handlers.insert(handler.name.clone(), Arc::new(handler));
        Ok(())
    }

    /// Add a directed edge. Both ends must already be registered.
    pub fn register_transition(
        &mut self,
        source: &str,
        target: &str,
        hydration: Option<HydrationCallback>,
    ) -> Result<()> {
        for end in [source, target] {
            if !self.handlers.contains_key(end) {
                return Err(TriageError::Registry(format!(
                    "transition {source} -> {target} references unknown handler '{end}'"
                )));
            }
        }
        if self.is_valid_transition(source, target) {
            return Err(TriageError::Registry(format!(
                "transition {source} -> {target} is already registered"
            )));
        }
        self.edges
            .entry(source.to_string())
            .or_default()
            .push(Transition {
                source: source.to_string(),
                target: target.to_string(),
                hydration,
            });
        Ok(())
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Look a handler up by name; unknown names resolve to the entry handler.
    pub fn resolve(&self, name: &str) -> Arc<Handler> {
        match self.handlers.get(name) {
            Some(handler) => handler.clone(),
            None => {
                warn!("unknown handler '{}', falling back to {}", name, self.entry);
                self.handlers[&self.entry].clone()
            }
        }
    }

    pub fn is_valid_transition(&self, source: &str, target: &str) -> bool {
        self.transition(source, target).is_some()
    }

    pub fn transition(&self, source: &str, target: &str) -> Option<&Transition> {
        self.edges
            .get(source)?
            .iter()
            .find(|edge| edge.target == target)
    }

    pub fn transitions_from(&self, source: &str) -> &[Transition] {
        self.edges.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Handlers in registration order.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<Handler>> {
        self.order.iter().filter_map(|name| self.handlers.get(name))
    }

    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        self.handlers()
            .map(|h| HandlerDescriptor {
                name: h.name.clone(),
                description: h.description.clone(),
                tools: h.tools.clone(),
                transitions: self
                    .transitions_from(&h.name)
                    .iter()
                    .map(|t| t.target.clone())
                    .collect(),
                required_gates: h.required_gates.clone(),
            })
            .collect()
    }
}
