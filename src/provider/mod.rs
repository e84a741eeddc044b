//! Completion service contract
//!
//! What this module provides
//! - The one seam through which the router talks to a language model: a
//!   system prompt, a single user message, a JSON schema and a model tier in;
//!   a JSON value that satisfies the schema out
//!
//! Exports
//! - Models
//!   - `CompletionRequest { system_prompt, user_message, response_schema, schema_name, tier }`
//!   - `ModelTier::{Classifier, Reasoning}`
//! - Services
//!   - `CompletionSvc = BoxCloneService<CompletionRequest, Value, BoxError>`
//!   - `SharedCompletion`: cloneable, `Sync` handle with a typed `complete_typed::<T>()`
//!   - Implementations: `OpenAICompletion`, `FixedCompletion`, `ScriptedCompletion`
//!
//! Implementation strategy
//! - Schemas are derived with `schemars`, so the type a caller deserializes into
//!   is the schema it sends
//! - A result that does not deserialize is a contract violation (never retried)
//! - `SharedCompletion` clones the boxed service out of its mutex before calling,
//!   so concurrent gate checks do not serialize on the lock
//!
//! Testing strategy
//! - Scripted fakes return queued values and record every request they saw

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{Result, TriageError};

/// Which class of model serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Fast, cheap model for gates and intent classification
    Classifier,
    /// Model driving handler decisions
    Reasoning,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub response_schema: Value,
    pub schema_name: String,
    pub tier: ModelTier,
}

impl CompletionRequest {
    /// Build a request whose schema is derived from `T`.
    pub fn for_type<T: JsonSchema>(
        schema_name: impl Into<String>,
        system_prompt: impl Into<String>,
        user_message: impl Into<String>,
        tier: ModelTier,
    ) -> Self {
        let response_schema = serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null);
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            response_schema,
            schema_name: schema_name.into(),
            tier,
        }
    }
}

pub type CompletionSvc = BoxCloneService<CompletionRequest, Value, BoxError>;

/// Shareable handle around a boxed completion service.
#[derive(Clone)]
pub struct SharedCompletion {
    inner: Arc<Mutex<CompletionSvc>>,
}

impl SharedCompletion {
    pub fn new<S>(svc: S) -> Self
    where
        S: Service<CompletionRequest, Response = Value, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(BoxCloneService::new(svc))),
        }
    }

    pub async fn complete(&self, req: CompletionRequest) -> Result<Value> {
        let mut svc = self.inner.lock().await.clone();
        svc.ready()
            .await
            .map_err(TriageError::from_boxed)?
            .call(req)
            .await
            .map_err(TriageError::from_boxed)
    }

    /// Complete and deserialize into `T`, whose schema is sent along.
    pub async fn complete_typed<T>(
        &self,
        schema_name: &str,
        system_prompt: impl Into<String>,
        user_message: impl Into<String>,
        tier: ModelTier,
    ) -> Result<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let req = CompletionRequest::for_type::<T>(schema_name, system_prompt, user_message, tier);
        let raw = self.complete(req).await?;
        serde_json::from_value(raw).map_err(|e| TriageError::contract(schema_name, e.to_string()))
    }
}

impl std::fmt::Debug for SharedCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCompletion").finish_non_exhaustive()
    }
}

/// Completion backed by the OpenAI chat API in JSON-schema response mode.
#[derive(Clone)]
pub struct OpenAICompletion {
    client: Client<OpenAIConfig>,
    models: ModelConfig,
}

impl OpenAICompletion {
    pub fn new(models: ModelConfig) -> Self {
        Self {
            client: Client::new(),
            models,
        }
    }

    pub fn with_client(client: Client<OpenAIConfig>, models: ModelConfig) -> Self {
        Self { client, models }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Classifier => &self.models.classifier_model,
            ModelTier::Reasoning => &self.models.reasoning_model,
        }
    }
}

impl Service<CompletionRequest> for OpenAICompletion {
    type Response = Value;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CompletionRequest) -> Self::Future {
        let client = self.client.clone();
        let model = self.model_for(req.tier).to_string();
        Box::pin(async move {
            let system = ChatCompletionRequestSystemMessageArgs::default()
                .content(req.system_prompt)
                .build()
                .map_err(TriageError::from)?;
            let user = ChatCompletionRequestUserMessageArgs::default()
                .content(req.user_message)
                .build()
                .map_err(TriageError::from)?;
            let request = CreateChatCompletionRequestArgs::default()
                .model(&model)
                .messages(vec![system.into(), user.into()])
                .response_format(ResponseFormat::JsonSchema {
                    json_schema: ResponseFormatJsonSchema {
                        description: None,
                        name: req.schema_name.clone(),
                        schema: Some(req.response_schema),
                        strict: Some(false),
                    },
                })
                .build()
                .map_err(TriageError::from)?;

            let response = client
                .chat()
                .create(request)
                .await
                .map_err(TriageError::from)?;
            let content = response
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .ok_or_else(|| TriageError::Completion("no content in response".into()))?;
            debug!(model = %model, schema = %req.schema_name, "completion received");
            let value: Value = serde_json::from_str(&content)
                .map_err(|e| TriageError::contract(req.schema_name, e.to_string()))?;
            Ok(value)
        })
    }
}

/// Always answers with the same value.
#[derive(Debug, Clone)]
pub struct FixedCompletion {
    value: Value,
}

impl FixedCompletion {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl Service<CompletionRequest> for FixedCompletion {
    type Response = Value;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: CompletionRequest) -> Self::Future {
        let value = self.value.clone();
        Box::pin(async move { Ok(value) })
    }
}

/// Answers from a queue and records each request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCompletion {
    replies: Arc<std::sync::Mutex<VecDeque<std::result::Result<Value, String>>>>,
    seen: Arc<std::sync::Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedCompletion {
    pub fn new(replies: impl IntoIterator<Item = Value>) -> Self {
        Self {
            replies: Arc::new(std::sync::Mutex::new(replies.into_iter().map(Ok).collect())),
            seen: Arc::default(),
        }
    }

    /// Queue a failure for the next call.
    pub fn push_failure(&self, message: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Err(message.into()));
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Service<CompletionRequest> for ScriptedCompletion {
    type Response = Value;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CompletionRequest) -> Self::Future {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(req);
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        Box::pin(async move {
            match next {
                Some(Ok(value)) => Ok(value),
                Some(Err(message)) => Err(Box::new(TriageError::Completion(message)) as BoxError),
                None => Err(Box::new(TriageError::Completion("script exhausted".into())) as BoxError),
            }
        })
    }
}
