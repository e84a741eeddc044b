//! Tool system for handlers
//!
//! Tools are the only code besides hydration callbacks that may mutate the
//! shared context. A tool receives structured arguments plus `&mut
//! SharedContext` and returns a JSON value.
//!
//! Arguments that do not match a typed tool's schema are a contract violation
//! and fail the turn.

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::context::SharedContext;
use crate::error::{Result, TriageError};

/// Trait for all tools that handlers can call
#[async_trait]
pub trait Tool: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's arguments
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, arguments: Value, ctx: &mut SharedContext) -> Result<Value>;
}

type ToolFn = dyn Fn(Value, &mut SharedContext) -> Result<Value> + Send + Sync;

/// A function-based tool
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters_schema: Value,
    function: Arc<ToolFn>,
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl FunctionTool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        function: F,
    ) -> Self
    where
        F: Fn(Value, &mut SharedContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema,
            function: Arc::new(function),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters_schema.clone()
    }

    async fn execute(&self, arguments: Value, ctx: &mut SharedContext) -> Result<Value> {
        (self.function)(arguments, ctx)
    }
}

/// Build a tool whose arguments deserialize into `A`; the schema comes from `A`.
pub fn tool_typed<A, F>(
    name: impl Into<String>,
    description: impl Into<String>,
    function: F,
) -> FunctionTool
where
    A: DeserializeOwned + JsonSchema,
    F: Fn(A, &mut SharedContext) -> Result<Value> + Send + Sync + 'static,
{
    let name = name.into();
    let schema = serde_json::to_value(schema_for!(A)).unwrap_or(Value::Null);
    let boundary = name.clone();
    FunctionTool::new(name, description, schema, move |args, ctx| {
        // Models send `null` for no-argument calls.
        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };
        let typed: A = serde_json::from_value(args)
            .map_err(|e| TriageError::contract(boundary.clone(), e.to_string()))?;
        function(typed, ctx)
    })
}

/// Description of a tool as shown to a handler model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Name-indexed tool catalogue shared by all handlers.
#[derive(Debug, Clone, Default)]
pub struct ToolBox {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(TriageError::Registry(format!(
                "tool '{name}' is already registered"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Result<Self> {
        self.register(Arc::new(tool))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Specs for `names`, skipping unknown ones.
    pub fn specs<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Vec<ToolSpec> {
        names
            .into_iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    pub fn ensure_known<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Result<()> {
        for name in names {
            if !self.contains(name) {
                return Err(TriageError::Registry(format!("unknown tool '{name}'")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct SeatArgs {
        confirmation_number: String,
        new_seat: String,
    }

    fn update_seat() -> FunctionTool {
        tool_typed("update_seat", "Update the seat", |args: SeatArgs, ctx| {
            ctx.confirmation_number = Some(args.confirmation_number.clone());
            ctx.seat_number = Some(args.new_seat.clone());
            Ok(json!(format!("Updated seat to {}", args.new_seat)))
        })
    }

    #[tokio::test]
    async fn typed_tool_mutates_context() {
        let tool = update_seat();
        let mut ctx = SharedContext::default();
        let out = tool
            .execute(json!({"confirmation_number": "LL0EZ6", "new_seat": "23A"}), &mut ctx)
            .await
            .unwrap();
        assert_eq!(out, json!("Updated seat to 23A"));
        assert_eq!(ctx.seat_number.as_deref(), Some("23A"));
    }

    #[tokio::test]
    async fn bad_arguments_are_a_contract_violation() {
        let tool = update_seat();
        let mut ctx = SharedContext::default();
        let err = tool
            .execute(json!({"new_seat": 23}), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::ContractViolation { ref boundary, .. } if boundary == "update_seat"));
        assert_eq!(ctx, SharedContext::default());
    }

    #[test]
    fn schema_is_derived_from_arguments() {
        let schema = update_seat().parameters_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["new_seat"].is_object());
    }

    #[test]
    fn toolbox_rejects_duplicates_and_reports_unknown() {
        let mut tools = ToolBox::new().with_tool(update_seat()).unwrap();
        assert!(tools.register(Arc::new(update_seat())).is_err());
        let names = vec!["update_seat".to_string(), "teleport".to_string()];
        assert_eq!(tools.specs(&names).len(), 1);
        assert!(tools.ensure_known(&names).is_err());
    }
}
