//! Relay mediator core.
//!
//! In-process dispatch engine: requests route to exactly one handler, events
//! fan out to every registered handler concurrently, and each invocation
//! threads through a per-request-type chain of behaviors (tracing,
//! validation, retry, circuit breaking, rate limiting, idempotency).
//!
//! - `Mediator`: `send` / `publish` entry points with the admission gate
//! - `MediatorBuilder`: explicit startup registration; frozen afterwards
//! - `PipelineBehavior` / `Next`: the composable behavior contract
//! - `EnvelopeRouter`: decodes inbound wire envelopes into local dispatch

pub mod admission;
pub mod behaviors;
pub mod breaker;
pub mod mediator;
pub mod message;
pub mod pipeline;
pub mod registry;
pub mod routing;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use breaker::{CircuitBreaker, CircuitState};
pub use mediator::{Mediator, MediatorConfig};
pub use message::{
    CallContext, Event, EventHandler, Request, RequestHandler, Scope, Validator,
};
pub use pipeline::{priority, Next, PipelineBehavior};
pub use registry::{BuildError, MediatorBuilder};
pub use routing::EnvelopeRouter;
