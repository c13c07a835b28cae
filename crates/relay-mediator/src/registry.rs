//! Handler registry and startup registration.
//!
//! Registration is explicit and happens once; `build` freezes the registry,
//! so the warm path reads an immutable map keyed by `TypeId` with no locks.
//! Handler *factories* are cached here; instances are produced per call
//! from the per-call scope.

use crate::behaviors::{
    CircuitBreakerBehavior, RetryBehavior, RetryPolicy, TracingBehavior, ValidationBehavior,
};
use crate::mediator::{Mediator, MediatorConfig};
use crate::message::{Event, EventHandler, Request, RequestHandler, Scope, Validator};
use crate::pipeline::PipelineBehavior;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

pub type RequestHandlerFactory<R> =
    Arc<dyn Fn(&Scope) -> Arc<dyn RequestHandler<R>> + Send + Sync>;
pub type EventHandlerFactory<E> = Arc<dyn Fn(&Scope) -> Arc<dyn EventHandler<E>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Exactly one request handler per request type; a second registration
    /// fails at startup.
    #[error("duplicate request handler for {0}")]
    DuplicateRequestHandler(String),

    /// Validators or behaviors were registered for a request type that
    /// never got a handler.
    #[error("no request handler registered for {0}")]
    MissingHandler(String),
}

/// Finalized per-request-type entry: the cached factory plus the memoized
/// behavior chain, sorted outermost-first.
pub(crate) struct RequestEntry<R: Request> {
    pub(crate) factory: RequestHandlerFactory<R>,
    pub(crate) behaviors: Vec<Arc<dyn PipelineBehavior<R>>>,
}

/// Event handlers in registration order.
pub(crate) struct EventEntry<E: Event> {
    pub(crate) factories: Vec<EventHandlerFactory<E>>,
}

/// Frozen lookup tables; built once, read concurrently forever.
pub(crate) struct HandlerRegistry {
    requests: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    events: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    pub(crate) fn request_entry<R: Request>(&self) -> Option<&RequestEntry<R>> {
        self.requests
            .get(&TypeId::of::<R>())
            .and_then(|slot| slot.downcast_ref::<RequestEntry<R>>())
    }

    pub(crate) fn event_entry<E: Event>(&self) -> Option<&EventEntry<E>> {
        self.events
            .get(&TypeId::of::<E>())
            .and_then(|slot| slot.downcast_ref::<EventEntry<E>>())
    }
}

struct PendingRequestEntry<R: Request> {
    factory: Option<RequestHandlerFactory<R>>,
    behaviors: Vec<Arc<dyn PipelineBehavior<R>>>,
    validators: Vec<Arc<dyn Validator<R>>>,
}

type Finalize = Box<
    dyn FnOnce(
            Box<dyn Any + Send + Sync>,
            &MediatorConfig,
        ) -> Result<Box<dyn Any + Send + Sync>, BuildError>
        + Send,
>;

struct PendingRequest {
    slot: Box<dyn Any + Send + Sync>,
    finalize: Finalize,
}

/// Turns the accumulated registrations for `R` into a frozen entry with the
/// standard behavior chain woven in by priority.
fn finalize_request<R: Request>(
    slot: Box<dyn Any + Send + Sync>,
    config: &MediatorConfig,
) -> Result<Box<dyn Any + Send + Sync>, BuildError> {
    let pending = slot
        .downcast::<PendingRequestEntry<R>>()
        .expect("pending slot holds the entry it was created with");
    let PendingRequestEntry {
        factory,
        mut behaviors,
        validators,
    } = *pending;

    let factory = factory.ok_or_else(|| BuildError::MissingHandler(R::name().to_string()))?;

    if config.enable_tracing {
        behaviors.push(Arc::new(TracingBehavior::<R>::default()));
    }
    if let Some(settings) = &config.circuit_breaker {
        behaviors.push(Arc::new(CircuitBreakerBehavior::<R>::new(settings.clone())));
    }
    if !validators.is_empty() {
        behaviors.push(Arc::new(ValidationBehavior::new(validators)));
    }
    if let Some(retry) = &config.retry {
        if retry.max_attempts > 1 {
            behaviors.push(Arc::new(RetryBehavior::<R>::new(RetryPolicy::from_config(
                retry,
            ))));
        }
    }
    behaviors.sort_by_key(|b| std::cmp::Reverse(b.priority()));

    Ok(Box::new(RequestEntry::<R> { factory, behaviors }))
}

/// Startup registration surface. Seed it with a [`MediatorConfig`], register
/// everything, then `build`; the result is immutable.
pub struct MediatorBuilder {
    config: MediatorConfig,
    requests: HashMap<TypeId, PendingRequest>,
    events: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MediatorBuilder {
    pub(crate) fn new(config: MediatorConfig) -> Self {
        Self {
            config,
            requests: HashMap::new(),
            events: HashMap::new(),
        }
    }

    fn pending_request<R: Request>(&mut self) -> &mut PendingRequestEntry<R> {
        self.requests
            .entry(TypeId::of::<R>())
            .or_insert_with(|| PendingRequest {
                slot: Box::new(PendingRequestEntry::<R> {
                    factory: None,
                    behaviors: Vec::new(),
                    validators: Vec::new(),
                }),
                finalize: Box::new(finalize_request::<R>),
            })
            .slot
            .downcast_mut::<PendingRequestEntry<R>>()
            .expect("pending slot holds the entry it was created with")
    }

    fn event_entry<E: Event>(&mut self) -> &mut EventEntry<E> {
        self.events
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                Box::new(EventEntry::<E> {
                    factories: Vec::new(),
                })
            })
            .downcast_mut::<EventEntry<E>>()
            .expect("event slot holds the entry it was created with")
    }

    /// Register the single handler for `R` as a shared instance.
    pub fn register_request_handler<R, H>(self, handler: H) -> Result<Self, BuildError>
    where
        R: Request,
        H: RequestHandler<R> + 'static,
    {
        let handler: Arc<dyn RequestHandler<R>> = Arc::new(handler);
        self.register_request_factory::<R, _>(move |_scope| handler.clone())
    }

    /// Register the single handler for `R` as a per-call factory. The
    /// factory is cached; the instances it produces are not.
    pub fn register_request_factory<R, F>(mut self, factory: F) -> Result<Self, BuildError>
    where
        R: Request,
        F: Fn(&Scope) -> Arc<dyn RequestHandler<R>> + Send + Sync + 'static,
    {
        let entry = self.pending_request::<R>();
        if entry.factory.is_some() {
            return Err(BuildError::DuplicateRequestHandler(R::name().to_string()));
        }
        entry.factory = Some(Arc::new(factory));
        Ok(self)
    }

    pub fn register_event_handler<E, H>(self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let handler: Arc<dyn EventHandler<E>> = Arc::new(handler);
        self.register_event_factory::<E, _>(move |_scope| handler.clone())
    }

    pub fn register_event_factory<E, F>(mut self, factory: F) -> Self
    where
        E: Event,
        F: Fn(&Scope) -> Arc<dyn EventHandler<E>> + Send + Sync + 'static,
    {
        self.event_entry::<E>().factories.push(Arc::new(factory));
        self
    }

    pub fn register_validator<R, V>(mut self, validator: V) -> Self
    where
        R: Request,
        V: Validator<R> + 'static,
    {
        self.pending_request::<R>().validators.push(Arc::new(validator));
        self
    }

    /// Register a custom behavior for `R`; it slots into the chain by its
    /// own priority.
    pub fn register_behavior<R, B>(mut self, behavior: B) -> Self
    where
        R: Request,
        B: PipelineBehavior<R> + 'static,
    {
        self.pending_request::<R>().behaviors.push(Arc::new(behavior));
        self
    }

    pub fn build(self) -> Result<Mediator, BuildError> {
        let MediatorBuilder {
            config,
            requests,
            events,
        } = self;

        let mut finalized = HashMap::with_capacity(requests.len());
        for (type_id, pending) in requests {
            let entry = (pending.finalize)(pending.slot, &config)?;
            finalized.insert(type_id, entry);
        }

        let registry = HandlerRegistry {
            requests: finalized,
            events,
        };
        Ok(Mediator::from_parts(registry, config))
    }
}
