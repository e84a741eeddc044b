//! # Safety gates
//!
//! A gate looks at the latest user message only and returns a
//! [`GateVerdict`]. Each handler names the gates that must pass while it is
//! active; [`GateSet::evaluate`] runs them concurrently and reports one
//! [`GuardrailCheck`] per required gate.
//!
//! Reporting follows a fixed rule. When any gate trips, the first tripped gate
//! in the handler's required order is the only failing check and the only one
//! carrying reasoning; the others are reported as passed with empty reasoning.
//! When nothing trips, every check keeps its own reasoning.
//!
//! Gates provided here:
//! - [`KeywordGate`]: blocks messages containing any listed pattern
//! - [`MaxLengthGate`]: blocks messages over a character budget
//! - [`ClassifierGate`]: asks the completion service for `{reasoning, allowed}`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, TriageError};
use crate::provider::{ModelTier, SharedCompletion};
use crate::recording::now_ms;

/// What a single gate decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,
    pub reasoning: String,
}

impl GateVerdict {
    pub fn pass(reasoning: impl Into<String>) -> Self {
        Self {
            passed: true,
            reasoning: reasoning.into(),
        }
    }

    pub fn trip(reasoning: impl Into<String>) -> Self {
        Self {
            passed: false,
            reasoning: reasoning.into(),
        }
    }
}

/// A check applied to every inbound message.
#[async_trait]
pub trait SafetyGate: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, message: &str) -> Result<GateVerdict>;
}

/// Observer-facing record of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailCheck {
    pub id: String,
    pub name: String,
    pub input: String,
    pub reasoning: String,
    pub passed: bool,
    /// Milliseconds since the Unix epoch
    pub timestamp: f64,
}

/// Result of evaluating a handler's gates.
#[derive(Debug, Clone)]
pub struct GateEvaluation {
    pub checks: Vec<GuardrailCheck>,
    /// `(gate name, reasoning)` of the first tripped gate
    pub tripped: Option<(String, String)>,
}

impl GateEvaluation {
    pub fn passed(&self) -> bool {
        self.tripped.is_none()
    }
}

/// Named gates available to handlers.
#[derive(Clone, Default)]
pub struct GateSet {
    gates: HashMap<String, Arc<dyn SafetyGate>>,
}

impl GateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gate: Arc<dyn SafetyGate>) -> Result<()> {
        let name = gate.name().to_string();
        if self.gates.contains_key(&name) {
            return Err(TriageError::Registry(format!(
                "gate '{name}' is already registered"
            )));
        }
        self.gates.insert(name, gate);
        Ok(())
    }

    pub fn with_gate(mut self, gate: Arc<dyn SafetyGate>) -> Result<Self> {
        self.register(gate)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }

    /// Fail with [`TriageError::UnknownGate`] on the first unregistered name.
    pub fn ensure_known<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Result<()> {
        for name in names {
            if !self.contains(name) {
                return Err(TriageError::UnknownGate(name.clone()));
            }
        }
        Ok(())
    }

    /// Run `required` gates against `message`.
    pub async fn evaluate(&self, required: &[String], message: &str) -> Result<GateEvaluation> {
        let gates = required
            .iter()
            .map(|name| {
                self.gates
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TriageError::UnknownGate(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let verdicts = join_all(gates.iter().map(|gate| gate.check(message)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let tripped = required
            .iter()
            .zip(&verdicts)
            .find(|(_, verdict)| !verdict.passed)
            .map(|(name, verdict)| (name.clone(), verdict.reasoning.clone()));

        let timestamp = now_ms();
        let checks = required
            .iter()
            .zip(&verdicts)
            .map(|(name, verdict)| {
                let (passed, reasoning) = match &tripped {
                    Some((failed, why)) if failed == name => (false, why.clone()),
                    Some(_) => (true, String::new()),
                    None => (true, verdict.reasoning.clone()),
                };
                GuardrailCheck {
                    id: Uuid::new_v4().simple().to_string(),
                    name: name.clone(),
                    input: message.to_string(),
                    reasoning,
                    passed,
                    timestamp,
                }
            })
            .collect();

        match &tripped {
            Some((gate, reasoning)) => info!("🛑 gate {} tripped: {}", gate, reasoning),
            None => debug!("{} gate(s) passed", required.len()),
        }
        Ok(GateEvaluation { checks, tripped })
    }
}

impl std::fmt::Debug for GateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.gates.keys().collect();
        names.sort();
        f.debug_struct("GateSet").field("gates", &names).finish()
    }
}

/// Blocks messages containing any listed pattern (case-insensitive).
#[derive(Debug, Clone)]
pub struct KeywordGate {
    name: String,
    patterns: Vec<String>,
}

impl KeywordGate {
    pub fn new(name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl SafetyGate for KeywordGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, message: &str) -> Result<GateVerdict> {
        let lowered = message.to_lowercase();
        Ok(match self.patterns.iter().find(|p| lowered.contains(p.as_str())) {
            Some(pattern) => GateVerdict::trip(format!("Message contains blocked pattern: {pattern}")),
            None => GateVerdict::pass("No blocked patterns found"),
        })
    }
}

/// Blocks messages longer than `max_chars`.
#[derive(Debug, Clone)]
pub struct MaxLengthGate {
    name: String,
    max_chars: usize,
}

impl MaxLengthGate {
    pub fn new(max_chars: usize) -> Self {
        Self {
            name: format!("MaxLength_{max_chars}"),
            max_chars,
        }
    }
}

#[async_trait]
impl SafetyGate for MaxLengthGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, message: &str) -> Result<GateVerdict> {
        let len = message.chars().count();
        Ok(if len > self.max_chars {
            GateVerdict::trip(format!(
                "Message exceeds maximum length of {} characters",
                self.max_chars
            ))
        } else {
            GateVerdict::pass("")
        })
    }
}

/// Structured answer a classifier gate expects.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ClassifierVerdict {
    /// Brief explanation of the decision
    pub reasoning: String,
    /// True when the message may proceed
    pub allowed: bool,
}

/// Gate decided by the completion service.
#[derive(Debug, Clone)]
pub struct ClassifierGate {
    name: String,
    instructions: String,
    completion: SharedCompletion,
}

impl ClassifierGate {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        completion: SharedCompletion,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            completion,
        }
    }
}

#[async_trait]
impl SafetyGate for ClassifierGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, message: &str) -> Result<GateVerdict> {
        let verdict: ClassifierVerdict = self
            .completion
            .complete_typed(
                "gate_verdict",
                self.instructions.clone(),
                message,
                ModelTier::Classifier,
            )
            .await?;
        Ok(GateVerdict {
            passed: verdict.allowed,
            reasoning: verdict.reasoning,
        })
    }
}
