//! Built-in pipeline behaviors.
//!
//! Default nesting, outermost first: tracing, concurrency limit, rate
//! limit, circuit breaker, validation, idempotency, retry, handler.

mod circuit_breaker;
mod concurrency;
mod idempotency;
mod rate_limit;
mod retry;
mod tracing;
mod validation;

pub use self::circuit_breaker::{CircuitBreakerBehavior, CircuitBreakerSettings};
pub use self::concurrency::ConcurrencyLimitBehavior;
pub use self::idempotency::IdempotencyBehavior;
pub use self::rate_limit::RateLimitBehavior;
pub use self::retry::{RetryBehavior, RetryPolicy};
pub use self::tracing::TracingBehavior;
pub use self::validation::ValidationBehavior;
