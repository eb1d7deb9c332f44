//! State validation gate run before and after engine phases.

use crate::error::StopReason;
use crate::state::{StateError, StateSchema};

pub type Validator = fn(&StateSchema) -> Result<(), StateError>;

pub fn validate_step_bounds(state: &StateSchema) -> Result<(), StateError> {
    if state.current_step > state.max_steps {
        return Err(StateError::Validation(format!(
            "current_step={} exceeds max_steps={}",
            state.current_step, state.max_steps
        )));
    }
    Ok(())
}

pub fn validate_plan_cursor(state: &StateSchema) -> Result<(), StateError> {
    if state.plan.cursor > state.plan.steps.len() {
        return Err(StateError::Validation(
            "plan cursor exceeds available plan steps".into(),
        ));
    }
    Ok(())
}

pub fn validate_final_consistency(state: &StateSchema) -> Result<(), StateError> {
    if state.stop_reason == Some(StopReason::Final)
        && state.final_result.as_deref().unwrap_or("").is_empty()
    {
        return Err(StateError::Validation(
            "stop_reason=final requires final_result".into(),
        ));
    }
    Ok(())
}

pub const DEFAULT_STATE_VALIDATORS: [Validator; 3] = [
    validate_step_bounds,
    validate_plan_cursor,
    validate_final_consistency,
];

/// Runs the schema's own validation plus a chain of extra validators.
pub struct StateValidationGate {
    validators: Vec<Validator>,
}

impl Default for StateValidationGate {
    fn default() -> Self {
        Self {
            validators: DEFAULT_STATE_VALIDATORS.to_vec(),
        }
    }
}

impl StateValidationGate {
    pub fn new(validators: Vec<Validator>) -> Self {
        Self { validators }
    }

    pub fn check(&self, state: &StateSchema) -> Result<(), StateError> {
        state.validate()?;
        for validator in &self.validators {
            validator(state)?;
        }
        Ok(())
    }
}
