//! Public dispatch entry points.
//!
//! One `Mediator` instance is shared process-wide. `send` routes a request
//! to its single handler through the admission gate and the memoized
//! behavior chain; `publish` fans an event out to every handler
//! concurrently with per-handler failure isolation. Handler panics never
//! unwind past this boundary.

use crate::admission::AdmissionGate;
use crate::behaviors::CircuitBreakerSettings;
use crate::message::{CallContext, Event, Request};
use crate::pipeline::Next;
use crate::registry::{HandlerRegistry, MediatorBuilder};
use futures::FutureExt;
use metrics::{counter, histogram};
use relay_common::DispatchError;
use relay_config::{AdmissionConfig, RelayConfig, RetryConfig};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Startup options for the mediator; fixed at build time.
#[derive(Clone)]
pub struct MediatorConfig {
    /// Admission gate ahead of the pipeline (send only).
    pub admission: AdmissionConfig,
    /// Retry behavior applied to every request type; `None` disables it.
    pub retry: Option<RetryConfig>,
    /// Per-request-type circuit breaker behavior; `None` disables it.
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    pub enable_tracing: bool,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            retry: None,
            circuit_breaker: None,
            enable_tracing: true,
        }
    }
}

impl MediatorConfig {
    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self {
            admission: config.admission.clone(),
            retry: Some(config.retry.clone()),
            // The admission gate already carries the global breaker; the
            // per-request-type breaker behavior stays opt-in.
            circuit_breaker: None,
            enable_tracing: true,
        }
    }

    pub fn with_circuit_breaker(mut self, settings: CircuitBreakerSettings) -> Self {
        self.circuit_breaker = Some(settings);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

pub struct Mediator {
    registry: HandlerRegistry,
    admission: Option<AdmissionGate>,
}

impl Mediator {
    pub fn builder(config: MediatorConfig) -> MediatorBuilder {
        MediatorBuilder::new(config)
    }

    pub(crate) fn from_parts(registry: HandlerRegistry, config: MediatorConfig) -> Self {
        Self {
            registry,
            admission: AdmissionGate::from_config(&config.admission),
        }
    }

    /// Dispatch a request to its single handler.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response, DispatchError> {
        self.send_with_ctx(request, CallContext::new()).await
    }

    pub async fn send_with_ctx<R: Request>(
        &self,
        request: R,
        ctx: CallContext,
    ) -> Result<R::Response, DispatchError> {
        counter!("relay_sent_total", "type" => R::name()).increment(1);
        let start = Instant::now();

        let result = self.send_inner(&request, &ctx).await;

        histogram!("relay_request_duration_seconds", "type" => R::name())
            .record(start.elapsed().as_secs_f64());
        match &result {
            Ok(_) => counter!("relay_succeeded_total", "type" => R::name()).increment(1),
            Err(e) => {
                counter!("relay_failed_total", "kind" => e.kind().as_str()).increment(1)
            }
        }

        result
    }

    async fn send_inner<R: Request>(
        &self,
        request: &R,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError> {
        let entry = self
            .registry
            .request_entry::<R>()
            .ok_or_else(|| DispatchError::HandlerNotFound(R::name().to_string()))?;

        let permit = match &self.admission {
            Some(gate) => Some(gate.admit().await?),
            None => None,
        };

        let handler = (entry.factory)(ctx.scope());

        let invocation = async {
            if entry.behaviors.is_empty() {
                // Fast path: no pipeline closure, straight to the handler.
                handler.handle(request, ctx).await
            } else {
                Next::new(&entry.behaviors, handler.as_ref())
                    .run(request, ctx)
                    .await
            }
        };

        let result = drive(invocation, ctx).await;

        if let Some(permit) = permit {
            permit.complete(result.as_ref().err());
        }

        result
    }

    /// Publish an event to all registered handlers.
    ///
    /// Completes when every handler has completed or errored. Failures are
    /// logged and counted, never returned to the publisher.
    pub async fn publish<E: Event>(&self, event: E) {
        self.publish_with_ctx(event, CallContext::new()).await
    }

    pub async fn publish_with_ctx<E: Event>(&self, event: E, ctx: CallContext) {
        counter!("relay_published_total", "type" => E::name()).increment(1);

        let factories = match self.registry.event_entry::<E>() {
            Some(entry) if !entry.factories.is_empty() => &entry.factories,
            // Zero handlers: nothing to schedule.
            _ => return,
        };

        if factories.len() == 1 {
            // Single handler: direct await, no completion array.
            let handler = (factories[0])(ctx.scope());
            let outcome = AssertUnwindSafe(handler.handle(&event, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(DispatchError::unhandled(panic_message(panic))));
            if let Err(e) = outcome {
                record_event_failure::<E>(&e);
            }
            return;
        }

        let event = Arc::new(event);
        let mut handles = Vec::with_capacity(factories.len());
        for factory in factories {
            let handler = factory(ctx.scope());
            let event = Arc::clone(&event);
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                handler.handle(event.as_ref(), &ctx).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => record_event_failure::<E>(&e),
                Err(join_error) => {
                    // A panicking handler must not take its siblings down.
                    let e = DispatchError::unhandled(join_error.to_string());
                    record_event_failure::<E>(&e);
                }
            }
        }
    }
}

fn record_event_failure<E: Event>(error: &DispatchError) {
    counter!(
        "relay_event_handler_failures_total",
        "type" => E::name(),
        "kind" => error.kind().as_str()
    )
    .increment(1);
    warn!(
        event_type = E::name(),
        kind = error.kind().as_str(),
        error = %error,
        "event handler failed"
    );
}

/// Wraps an invocation with panic capture, cancellation and deadline
/// awareness.
async fn drive<T>(
    invocation: impl Future<Output = Result<T, DispatchError>>,
    ctx: &CallContext,
) -> Result<T, DispatchError> {
    let guarded = async {
        AssertUnwindSafe(invocation)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DispatchError::unhandled(panic_message(panic))))
    };

    match ctx.deadline() {
        Some(deadline) => {
            let deadline = tokio::time::Instant::from_std(deadline);
            tokio::select! {
                _ = ctx.token().cancelled() => Err(DispatchError::Cancelled),
                outcome = tokio::time::timeout_at(deadline, guarded) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(DispatchError::Timeout),
                },
            }
        }
        None => tokio::select! {
            _ = ctx.token().cancelled() => Err(DispatchError::Cancelled),
            result = guarded => result,
        },
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
