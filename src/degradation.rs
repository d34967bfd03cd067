//! # Graceful Degradation
//!
//! Per-service fallback strategies returned when a protected call cannot reach
//! its downstream. Fallbacks are registered up front; at rejection time the
//! manager produces a degraded response instead of surfacing the breaker
//! rejection to the end user.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::breaker::{BreakerError, CallError, CircuitBreaker};

type FallbackFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;

/// How to answer for a service whose circuit is open or whose call failed
#[derive(Clone)]
pub enum FallbackStrategy {
    /// Serve a fixed response body
    StaticResponse(Value),
    /// Compute a response from the request context (cached lookups, simplified
    /// answers)
    Callable(FallbackFn),
    /// No useful answer exists: respond with an explicit degraded-mode notice
    DegradedMode { message: String },
}

impl FallbackStrategy {
    pub fn callable<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        Self::Callable(Arc::new(move |ctx| Box::pin(f(ctx))))
    }
}

impl fmt::Debug for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaticResponse(v) => f.debug_tuple("StaticResponse").field(v).finish(),
            Self::Callable(_) => f.debug_tuple("Callable").field(&"<fn>").finish(),
            Self::DegradedMode { message } => {
                f.debug_struct("DegradedMode").field("message", message).finish()
            }
        }
    }
}

/// A fallback answer, always explicitly marked as degraded
#[derive(Debug, Clone, Serialize)]
pub struct FallbackResponse {
    pub service: String,
    /// Always true; consumers can tell a degraded answer from a real one
    pub degraded: bool,
    pub body: Value,
}

/// Registry of per-service fallback strategies
#[derive(Debug, Default)]
pub struct DegradationManager {
    fallbacks: DashMap<String, FallbackStrategy>,
}

impl DegradationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: impl Into<String>, strategy: FallbackStrategy) {
        let service = service.into();
        info!(service = %service, strategy = ?strategy, "🪂 DEGRADATION: fallback registered");
        self.fallbacks.insert(service, strategy);
    }

    pub fn has_fallback(&self, service: &str) -> bool {
        self.fallbacks.contains_key(service)
    }

    /// Produce the degraded answer for a service, or None when no strategy is
    /// registered. `context` is passed through to callable strategies.
    pub async fn fallback(&self, service: &str, context: Value) -> Option<FallbackResponse> {
        let strategy = self.fallbacks.get(service).map(|s| s.value().clone())?;
        let body = match strategy {
            FallbackStrategy::StaticResponse(body) => body,
            FallbackStrategy::Callable(f) => f(context).await,
            FallbackStrategy::DegradedMode { message } => json!({
                "message": message,
                "service": service,
            }),
        };
        warn!(service = %service, "🪂 DEGRADATION: serving fallback response");
        Some(FallbackResponse {
            service: service.to_string(),
            degraded: true,
            body,
        })
    }

    /// Run an operation under breaker protection, serving the registered
    /// fallback when the circuit rejects the call or the operation fails.
    ///
    /// `Ok(Ok(value))` is a real answer; `Ok(Err(response))` a degraded one.
    /// An error means the call failed and no fallback exists for the service.
    pub async fn guarded_call<F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        context: Value,
        operation: F,
    ) -> Result<Result<Value, FallbackResponse>, CallError<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        match breaker.call(|| operation()).await {
            Ok(value) => Ok(Ok(value)),
            Err(err) => match self.fallback(breaker.service(), context).await {
                Some(response) => Ok(Err(response)),
                None => Err(match err {
                    CallError::Rejected(rejection) => CallError::Rejected(rejection),
                    CallError::Operation(e) => CallError::Operation(e),
                }),
            },
        }
    }

    /// Degraded answer for a breaker rejection without running anything.
    pub async fn reject_with_fallback(
        &self,
        rejection: &BreakerError,
        context: Value,
    ) -> Option<FallbackResponse> {
        let service = match rejection {
            BreakerError::CircuitOpen { service, .. } => service,
            BreakerError::StoreUnavailable { service, .. } => service,
        };
        self.fallback(service, context).await
    }
}
