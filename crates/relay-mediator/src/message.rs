//! Message and handler contracts plus the per-call context.

use async_trait::async_trait;
use relay_common::{short_type_name, DispatchError};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A message expecting exactly one response from exactly one handler.
pub trait Request: Send + Sync + 'static {
    type Response: Send + 'static;

    /// Logical type name; also the default wire `message_type`.
    fn name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }
}

/// A message expecting zero or more handlers and no response.
pub trait Event: Send + Sync + 'static {
    fn name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }
}

#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync {
    async fn handle(&self, request: &R, ctx: &CallContext)
        -> Result<R::Response, DispatchError>;
}

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E, ctx: &CallContext) -> Result<(), DispatchError>;
}

/// Pure request validator; all registered validators run and their messages
/// aggregate into one `Validation` failure.
pub trait Validator<R: Request>: Send + Sync {
    fn validate(&self, request: &R) -> Vec<String>;
}

/// Minimal per-call dependency scope: a `TypeId -> instance` map.
///
/// Handler factories resolve per-call collaborators from here, so a cached
/// factory never leaks process-wide state into an invocation.
#[derive(Clone, Default)]
pub struct Scope {
    values: Arc<parking_lot::RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide<T: Send + Sync + 'static>(&self, value: T) {
        self.values
            .write()
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }
}

/// Per-invocation context: cancellation, deadline, correlation, scope.
///
/// Cloning is cheap; nested `send`/`publish` calls inherit the context so
/// cancellation propagates through re-entrant dispatch.
#[derive(Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    correlation_id: Option<String>,
    message_id: Option<String>,
    scope: Scope,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            correlation_id: None,
            message_id: None,
            scope: Scope::new(),
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Wire message id for distributed deliveries; the idempotency behavior
    /// keys on this when no per-request extractor is configured.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;

    impl Request for Ping {
        type Response = String;
    }

    #[test]
    fn request_name_defaults_to_short_type_name() {
        assert_eq!(Ping::name(), "Ping");
    }

    #[test]
    fn scope_resolves_provided_values() {
        let scope = Scope::new();
        scope.provide(42u64);
        assert_eq!(scope.resolve::<u64>().as_deref(), Some(&42));
        assert!(scope.resolve::<String>().is_none());
    }

    #[test]
    fn context_deadline_counts_down() {
        let ctx = CallContext::new().with_deadline(Duration::from_secs(60));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }

    #[test]
    fn cancellation_is_visible_through_clones() {
        let ctx = CallContext::new();
        let child = ctx.clone();
        ctx.token().cancel();
        assert!(child.is_cancelled());
    }
}
