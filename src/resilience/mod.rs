//! Resilience: deadlines and retries
//!
//! What this module provides
//! - Explicit deadlines for every suspension point of a turn (completion calls,
//!   tool calls), and bounded retries for transient completion failures
//!
//! Exports
//! - Models
//!   - `RetryPolicy { max_retries, backoff: Backoff }`, built from `RetryConfig`
//!   - `ErrorClassifier` with `TransientOnly` (default) and `AlwaysRetry`
//! - Layers
//!   - `TimeoutLayer(operation, Duration)`: elapsed deadline becomes `TriageError::Timeout`
//!   - `RetryLayer<Classifier>`
//! - Utils
//!   - `with_deadline(operation, limit, fut)` for plain futures
//!
//! Implementation strategy
//! - Timeout: `tokio::time::timeout` around the inner future
//! - Retry: wrap a `Clone` inner service and drive a fresh clone per call, so
//!   no lock is held across an in-flight request; retry only what the
//!   classifier calls transient. Contract violations are never transient, so a
//!   malformed answer fails the turn on the first attempt
//! - Backoff grows geometrically and saturates at its cap
//!
//! Composition
//! - `ServiceBuilder::new().layer(TracingLayer::new()).layer(TimeoutLayer::new(..)).layer(RetryLayer::new(..)).service(OpenAICompletion::new(..))`
//!
//! Testing strategy
//! - Fake services that error in a scripted pattern (E E S) and assert call counts

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Result, TriageError};

/// Run `fut` under a deadline.
pub async fn with_deadline<F, T>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, ?limit, "deadline elapsed");
            Err(TriageError::Timeout {
                operation: operation.to_string(),
                limit,
            })
        }
    }
}

// ===== Retry =====

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f32,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            factor: 1.0,
            max: delay,
        }
    }

    pub fn exponential(initial: Duration, factor: f32, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
        }
    }

    /// Delay before retry number `attempt` (0-based), saturating at `max`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial.as_nanos() as f64 * f64::from(self.factor.max(1.0)).powi(exp);
        if nanos.is_finite() && nanos < self.max.as_nanos() as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.max
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Backoff,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff: Backoff::exponential(cfg.initial_delay, cfg.backoff_multiplier, cfg.max_delay),
        }
    }
}

pub trait ErrorClassifier: Send + Sync + 'static {
    fn retryable(&self, error: &BoxError) -> bool;
}

/// Retry only errors that [`TriageError::is_transient`] accepts; foreign
/// errors (transport failures) count as transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnly;

impl ErrorClassifier for TransientOnly {
    fn retryable(&self, error: &BoxError) -> bool {
        match error.downcast_ref::<TriageError>() {
            Some(typed) => typed.is_transient(),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlwaysRetry;

impl ErrorClassifier for AlwaysRetry {
    fn retryable(&self, _error: &BoxError) -> bool {
        true
    }
}

pub struct RetryLayer<C> {
    policy: RetryPolicy,
    classifier: C,
}

impl<C> RetryLayer<C> {
    pub fn new(policy: RetryPolicy, classifier: C) -> Self {
        Self { policy, classifier }
    }
}

/// Each call drives its own clone of the inner service, so concurrent
/// requests overlap.
#[derive(Clone)]
pub struct Retry<S, C> {
    inner: S,
    policy: RetryPolicy,
    classifier: C,
}

impl<S, C> Layer<S> for RetryLayer<C>
where
    C: Clone,
{
    type Service = Retry<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            policy: self.policy,
            classifier: self.classifier.clone(),
        }
    }
}

impl<S, C, Req> Service<Req> for Retry<S, C>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    C: ErrorClassifier + Clone,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let policy = self.policy;
        let classifier = self.classifier.clone();
        // Keep the instance that was polled ready; leave a fresh clone behind.
        let fresh = self.inner.clone();
        let mut svc = std::mem::replace(&mut self.inner, fresh);
        Box::pin(async move {
            let mut attempts: usize = 0;
            loop {
                let result = ServiceExt::ready(&mut svc).await?.call(req.clone()).await;
                match result {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if attempts >= policy.max_retries || !classifier.retryable(&e) {
                            return Err(e);
                        }
                        let delay = policy.backoff.delay_for_attempt(attempts);
                        attempts += 1;
                        warn!(attempt = attempts, ?delay, error = %e, "retrying completion");
                        sleep(delay).await;
                    }
                }
            }
        })
    }
}

// ===== Timeout =====

pub struct TimeoutLayer {
    operation: &'static str,
    dur: Duration,
}

impl TimeoutLayer {
    pub fn new(operation: &'static str, dur: Duration) -> Self {
        Self { operation, dur }
    }
}

#[derive(Clone)]
pub struct Timeout<S> {
    inner: S,
    operation: &'static str,
    dur: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            operation: self.operation,
            dur: self.dur,
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let dur = self.dur;
        let operation = self.operation;
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(r) => r,
                Err(_) => Err(Box::new(TriageError::Timeout {
                    operation: operation.to_string(),
                    limit: dur,
                }) as BoxError),
            }
        })
    }
}
