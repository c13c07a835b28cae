//! Validator aggregation ahead of the handler.

use crate::message::{CallContext, Request, Validator};
use crate::pipeline::{priority, Next, PipelineBehavior};
use async_trait::async_trait;
use relay_common::DispatchError;
use std::sync::Arc;

pub struct ValidationBehavior<R: Request> {
    validators: Vec<Arc<dyn Validator<R>>>,
}

impl<R: Request> ValidationBehavior<R> {
    pub fn new(validators: Vec<Arc<dyn Validator<R>>>) -> Self {
        Self { validators }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for ValidationBehavior<R> {
    fn priority(&self) -> i32 {
        priority::VALIDATION
    }

    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError> {
        let mut errors = Vec::new();
        for validator in &self.validators {
            errors.extend(validator.validate(request));
        }

        if !errors.is_empty() {
            return Err(DispatchError::Validation(errors.join("; ")));
        }

        next.run(request, ctx).await
    }
}
