//! Confidence-scored intent routing
//!
//! What this module provides
//! - An alternative to the handoff graph: one classifier call picks an intent
//!   with a confidence score, and the router either runs that intent's tool,
//!   asks the customer to rephrase, or falls back to a fixed answer
//!
//! Exports
//! - Models
//!   - `Classification { intent, confidence, reasoning, rewritten_prompt, entities[] }`
//!   - `Entity { type, value }`
//!   - `RouteDecision::{Execute, Clarify, Fallback}`
//!   - `AgentResponse { answer, routed_to, confidence, original_input, rewritten_input }`
//! - Services
//!   - `IntentClassifier::classify(input, catalogue)`: classifier-tier completion, validated
//!   - `ConfidenceRouter::handle(session_id, input)`
//! - Traits
//!   - `IntentTool`: answers a rewritten prompt with `{answer, reasoning}`
//!
//! Implementation strategy
//! - `confidence < clarify` → fallback; `clarify <= confidence < execute` →
//!   clarification, no tool; `confidence >= execute` → run the intent's tool
//!   with the rewritten prompt, or fall back when the intent is not registered
//! - Every path writes exactly one memory turn; tool reasoning is recorded only
//!   when a tool ran
//!
//! Testing strategy
//! - Scripted classifier replies at each threshold band; counting tool fake

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::RouterConfig;
use crate::error::{Result, TriageError};
use crate::memory::{ConversationTurn, MemoryStore};
use crate::provider::{ModelTier, SharedCompletion};
use crate::resilience::with_deadline;

pub const ROUTED_FALLBACK: &str = "fallback";
pub const ROUTED_CLARIFICATION: &str = "clarification";

const FALLBACK_ANSWER: &str = "I'm sorry, I'm not sure how to help with that. \
I can help you with questions about baggage, policies, booking, or refunds. \
Could you try rephrasing your question?";

/// A piece of information pulled out of the customer's message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    /// Kind of entity, e.g. `date`, `location`, `flight_number`
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Classifier output: intent, confidence, rewrite and entities in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    /// Name of the registered intent that should handle the message
    pub intent: String,
    /// Certainty between 0.0 and 1.0
    pub confidence: f64,
    /// Why this intent was chosen
    pub reasoning: String,
    /// The message restated clearly and concisely
    pub rewritten_prompt: String,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl Classification {
    pub fn validate(&self) -> Result<()> {
        if self.intent.trim().is_empty() {
            return Err(TriageError::contract("classification", "intent cannot be empty"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(TriageError::contract(
                "classification",
                format!("confidence must be within 0.0-1.0, got {}", self.confidence),
            ));
        }
        if self.rewritten_prompt.trim().is_empty() {
            return Err(TriageError::contract(
                "classification",
                "rewritten prompt cannot be empty",
            ));
        }
        Ok(())
    }

    /// Entities by type; a repeated type keeps its last value.
    pub fn entity_map(&self) -> HashMap<String, String> {
        self.entities
            .iter()
            .map(|e| (e.kind.clone(), e.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Execute,
    Clarify,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub execute: f64,
    pub clarify: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            execute: 0.7,
            clarify: 0.4,
        }
    }
}

impl From<&RouterConfig> for Thresholds {
    fn from(config: &RouterConfig) -> Self {
        Self {
            execute: config.execute_threshold,
            clarify: config.clarify_threshold,
        }
    }
}

impl Thresholds {
    pub fn decide(&self, classification: &Classification, registered: bool) -> RouteDecision {
        let confidence = classification.confidence;
        if confidence < self.clarify {
            RouteDecision::Fallback
        } else if confidence < self.execute {
            RouteDecision::Clarify
        } else if registered {
            RouteDecision::Execute
        } else {
            RouteDecision::Fallback
        }
    }
}

/// What an intent tool returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolAnswer {
    pub answer: String,
    /// How the answer was reached
    pub reasoning: String,
}

/// A tool the router can dispatch an intent to.
#[async_trait]
pub trait IntentTool: Send + Sync {
    fn name(&self) -> &str;

    /// One-line description shown to the classifier
    fn description(&self) -> &str;

    async fn answer(&self, prompt: &str) -> Result<ToolAnswer>;
}

/// Intent name → tool, in registration order.
#[derive(Clone, Default)]
pub struct IntentRegistry {
    order: Vec<String>,
    tools: HashMap<String, Arc<dyn IntentTool>>,
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn IntentTool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(TriageError::Registry(format!(
                "intent '{name}' is already registered"
            )));
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn with_tool(mut self, tool: Arc<dyn IntentTool>) -> Result<Self> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn contains(&self, intent: &str) -> bool {
        self.tools.contains_key(intent)
    }

    pub fn get(&self, intent: &str) -> Option<Arc<dyn IntentTool>> {
        self.tools.get(intent).cloned()
    }

    /// `- name: description` per intent, one per line.
    pub fn routing_descriptions(&self) -> String {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Debug for IntentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentRegistry")
            .field("intents", &self.order)
            .finish()
    }
}

/// Classifies, extracts entities and rewrites in one classifier-tier call.
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    completion: SharedCompletion,
}

impl IntentClassifier {
    pub fn new(completion: SharedCompletion) -> Self {
        Self { completion }
    }

    fn system_prompt(catalogue: &str, input: &str) -> String {
        format!(
            "You route airline customer messages to the right tool.\n\n\
             Available tools:\n{catalogue}\n\n\
             For the message below:\n\
             1. Pick the intent: the name of the tool that should handle it.\n\
             2. Give a confidence between 0.0 and 1.0.\n\
             3. Explain your reasoning briefly.\n\
             4. Rewrite the message as a clear, concise question.\n\
             5. Extract entities such as dates, locations and flight numbers as type/value pairs.\n\n\
             Message: {input}"
        )
    }

    pub async fn classify(&self, input: &str, catalogue: &str) -> Result<Classification> {
        let classification: Classification = self
            .completion
            .complete_typed(
                "classification",
                Self::system_prompt(catalogue, input),
                input,
                ModelTier::Classifier,
            )
            .await?;
        classification.validate()?;
        info!(
            intent = %classification.intent,
            confidence = classification.confidence,
            entities = classification.entities.len(),
            "🏷️ classified"
        );
        Ok(classification)
    }
}

/// Final answer of the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub answer: String,
    /// Intent name, `clarification` or `fallback`
    pub routed_to: String,
    pub confidence: f64,
    pub original_input: String,
    pub rewritten_input: String,
}

/// Classifier-driven router.
pub struct ConfidenceRouter {
    classifier: IntentClassifier,
    intents: IntentRegistry,
    memory: Arc<dyn MemoryStore>,
    thresholds: Thresholds,
    tool_timeout: std::time::Duration,
}

impl ConfidenceRouter {
    pub fn new(
        classifier: IntentClassifier,
        intents: IntentRegistry,
        memory: Arc<dyn MemoryStore>,
        config: &RouterConfig,
    ) -> Self {
        Self {
            classifier,
            intents,
            memory,
            thresholds: Thresholds::from(config),
            tool_timeout: config.tool_timeout,
        }
    }

    pub fn intents(&self) -> &IntentRegistry {
        &self.intents
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.memory
    }

    #[instrument(skip(self, input))]
    pub async fn handle(&self, session_id: &str, input: &str) -> Result<AgentResponse> {
        let catalogue = self.intents.routing_descriptions();
        let classification = self.classifier.classify(input, &catalogue).await?;

        let decision = self
            .thresholds
            .decide(&classification, self.intents.contains(&classification.intent));
        let (answer, routed_to, tool_reasoning) = match decision {
            RouteDecision::Fallback => {
                if classification.confidence >= self.thresholds.execute {
                    warn!(intent = %classification.intent, "unknown intent, falling back");
                }
                (FALLBACK_ANSWER.to_string(), ROUTED_FALLBACK.to_string(), None)
            }
            RouteDecision::Clarify => (
                format!(
                    "I'm not quite sure I understand. Could you rephrase your question? \
                     I think you might be asking about {}, but I want to make sure.",
                    classification.intent
                ),
                ROUTED_CLARIFICATION.to_string(),
                None,
            ),
            RouteDecision::Execute => {
                let tool = self.intents.get(&classification.intent).ok_or_else(|| {
                    TriageError::Registry(format!("unknown intent '{}'", classification.intent))
                })?;
                let reply = with_deadline(
                    tool.name(),
                    self.tool_timeout,
                    tool.answer(&classification.rewritten_prompt),
                )
                .await?;
                if reply.answer.trim().is_empty() {
                    return Err(TriageError::contract(
                        classification.intent.clone(),
                        "tool answer cannot be empty",
                    ));
                }
                (reply.answer, classification.intent.clone(), Some(reply.reasoning))
            }
        };
        info!(routed_to = %routed_to, ?decision, "🧭 routed");

        let response = AgentResponse {
            answer,
            routed_to,
            confidence: classification.confidence,
            original_input: input.to_string(),
            rewritten_input: classification.rewritten_prompt.clone(),
        };
        self.memory
            .save_turn(
                session_id,
                ConversationTurn {
                    user_input: input.to_string(),
                    agent_response: response.answer.clone(),
                    intent: classification.intent.clone(),
                    confidence: classification.confidence,
                    rewritten_prompt: classification.rewritten_prompt.clone(),
                    entities: classification.entity_map(),
                    classification_reasoning: classification.reasoning.clone(),
                    tool_reasoning,
                    created_at: Utc::now(),
                },
            )
            .await?;
        Ok(response)
    }
}

impl std::fmt::Debug for ConfidenceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfidenceRouter")
            .field("intents", &self.intents)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}
