//! Observability: tracing around completion calls
//!
//! What this module provides
//! - Structured spans and outcome logs around every completion request, so a
//!   turn's model traffic can be followed in any `tracing` subscriber
//!
//! Exports
//! - Layers
//!   - `TracingLayer` creating an `info_span!("completion", tier, schema)` per call
//! - Utils
//!   - `openai_stack(config)`: the production completion service with tracing,
//!     deadline and retry applied
//!
//! Implementation strategy
//! - Decorate the inner future with `Instrument`; log elapsed time on success
//!   and the error on failure. The library never installs a subscriber
//!
//! Testing strategy
//! - Wrap a `service_fn` and assert the response passes through untouched

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use serde_json::Value;
use tower::{BoxError, Layer, Service, ServiceBuilder};
use tracing::{info, info_span, warn, Instrument};

use crate::config::TriageConfig;
use crate::provider::{CompletionRequest, OpenAICompletion, SharedCompletion};
use crate::resilience::{RetryLayer, RetryPolicy, TimeoutLayer, TransientOnly};

/// Layer that adds tracing around completion calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone)]
pub struct Tracing<S> {
    inner: S,
}

impl<S> Layer<S> for TracingLayer {
    type Service = Tracing<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Tracing { inner }
    }
}

impl<S> Service<CompletionRequest> for Tracing<S>
where
    S: Service<CompletionRequest, Response = Value, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: CompletionRequest) -> Self::Future {
        let span = info_span!("completion", tier = ?req.tier, schema = %req.schema_name);
        let fut = self.inner.call(req).instrument(span.clone());
        Box::pin(
            async move {
                let started = Instant::now();
                let out = fut.await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match &out {
                    Ok(_) => info!(elapsed_ms, "completion ok"),
                    Err(e) => warn!(elapsed_ms, error = %e, "completion failed"),
                }
                out
            }
            .instrument(span),
        )
    }
}

/// OpenAI-backed completion with tracing, deadline and transient retries.
pub fn openai_stack(config: &TriageConfig) -> SharedCompletion {
    let svc = ServiceBuilder::new()
        .layer(TracingLayer::new())
        .layer(TimeoutLayer::new("completion", config.models.completion_timeout))
        .layer(RetryLayer::new(RetryPolicy::from(&config.retry), TransientOnly))
        .service(OpenAICompletion::new(config.models.clone()));
    SharedCompletion::new(svc)
}
