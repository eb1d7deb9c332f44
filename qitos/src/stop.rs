//! Stop criteria: ordered predicates checked each step; first match wins.

use crate::error::StopReason;
use crate::state::StateSchema;

/// Runtime facts criteria may consult beyond the state itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopContext {
    pub elapsed_seconds: f64,
    pub tokens_total: u64,
}

/// A matched stop condition.
#[derive(Debug, Clone, PartialEq)]
pub struct StopHit {
    pub reason: StopReason,
    pub detail: String,
}

/// One stop predicate. Criteria may keep internal state (e.g. stagnation
/// counters), so evaluation takes `&mut self`.
pub trait StopCriteria: Send + Sync {
    fn should_stop(
        &mut self,
        state: &StateSchema,
        step_count: u64,
        runtime: &StopContext,
    ) -> Option<StopHit>;
}

pub struct MaxStepsCriteria {
    max_steps: u64,
}

impl MaxStepsCriteria {
    pub fn new(max_steps: u64) -> Self {
        Self { max_steps }
    }
}

impl StopCriteria for MaxStepsCriteria {
    fn should_stop(
        &mut self,
        _state: &StateSchema,
        step_count: u64,
        _runtime: &StopContext,
    ) -> Option<StopHit> {
        if step_count >= self.max_steps {
            return Some(StopHit {
                reason: StopReason::BudgetSteps,
                detail: format!("step_id={step_count} reached max_steps={}", self.max_steps),
            });
        }
        None
    }
}

pub struct MaxRuntimeCriteria {
    max_runtime_seconds: f64,
}

impl MaxRuntimeCriteria {
    pub fn new(max_runtime_seconds: f64) -> Self {
        Self {
            max_runtime_seconds,
        }
    }
}

impl StopCriteria for MaxRuntimeCriteria {
    fn should_stop(
        &mut self,
        _state: &StateSchema,
        _step_count: u64,
        runtime: &StopContext,
    ) -> Option<StopHit> {
        if runtime.elapsed_seconds >= self.max_runtime_seconds {
            return Some(StopHit {
                reason: StopReason::BudgetTime,
                detail: format!(
                    "elapsed={:.3}s >= max_runtime_seconds={:.3}s",
                    runtime.elapsed_seconds, self.max_runtime_seconds
                ),
            });
        }
        None
    }
}

#[derive(Default)]
pub struct FinalResultCriteria;

impl StopCriteria for FinalResultCriteria {
    fn should_stop(
        &mut self,
        state: &StateSchema,
        _step_count: u64,
        _runtime: &StopContext,
    ) -> Option<StopHit> {
        if state.final_result.as_deref().unwrap_or("").is_empty() {
            return None;
        }
        Some(StopHit {
            reason: StopReason::Final,
            detail: "state.final_result is set".into(),
        })
    }
}

type SignatureFn = Box<dyn Fn(&StateSchema) -> String + Send + Sync>;

/// Stops after N consecutive identical state signatures.
pub struct StagnationCriteria {
    max_stagnant_steps: u32,
    signature: SignatureFn,
    last_signature: Option<String>,
    stagnant_steps: u32,
}

impl StagnationCriteria {
    pub fn new(max_stagnant_steps: u32) -> Self {
        Self::with_signature(max_stagnant_steps, |state| {
            format!("{:?}|{}", state.final_result, state.plan.cursor)
        })
    }

    pub fn with_signature<F>(max_stagnant_steps: u32, signature: F) -> Self
    where
        F: Fn(&StateSchema) -> String + Send + Sync + 'static,
    {
        Self {
            max_stagnant_steps,
            signature: Box::new(signature),
            last_signature: None,
            stagnant_steps: 0,
        }
    }
}

impl StopCriteria for StagnationCriteria {
    fn should_stop(
        &mut self,
        state: &StateSchema,
        _step_count: u64,
        _runtime: &StopContext,
    ) -> Option<StopHit> {
        let signature = (self.signature)(state);
        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.stagnant_steps += 1;
        } else {
            self.stagnant_steps = 0;
            self.last_signature = Some(signature);
        }
        if self.stagnant_steps >= self.max_stagnant_steps {
            return Some(StopHit {
                reason: StopReason::Stagnation,
                detail: format!("stagnant_steps={}", self.stagnant_steps),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(elapsed: f64) -> StopContext {
        StopContext {
            elapsed_seconds: elapsed,
            tokens_total: 0,
        }
    }

    /// **Scenario**: step budget trips at the boundary, not before.
    #[test]
    fn max_steps_boundary() {
        let mut criteria = MaxStepsCriteria::new(3);
        let state = StateSchema::new("t", 10);
        assert!(criteria.should_stop(&state, 2, &ctx(0.0)).is_none());
        let hit = criteria.should_stop(&state, 3, &ctx(0.0)).unwrap();
        assert_eq!(hit.reason, StopReason::BudgetSteps);
    }

    /// **Scenario**: wall-clock budget reads elapsed time from the context.
    #[test]
    fn max_runtime() {
        let mut criteria = MaxRuntimeCriteria::new(1.5);
        let state = StateSchema::new("t", 10);
        assert!(criteria.should_stop(&state, 0, &ctx(1.0)).is_none());
        let hit = criteria.should_stop(&state, 0, &ctx(2.0)).unwrap();
        assert_eq!(hit.reason, StopReason::BudgetTime);
    }

    /// **Scenario**: a set final result stops with reason final.
    #[test]
    fn final_result() {
        let mut criteria = FinalResultCriteria;
        let mut state = StateSchema::new("t", 10);
        assert!(criteria.should_stop(&state, 0, &ctx(0.0)).is_none());
        state.final_result = Some("42".into());
        let hit = criteria.should_stop(&state, 0, &ctx(0.0)).unwrap();
        assert_eq!(hit.reason, StopReason::Final);
    }

    /// **Scenario**: N identical signatures in a row trip stagnation; any
    /// change resets the counter.
    #[test]
    fn stagnation_counting() {
        let mut criteria = StagnationCriteria::with_signature(2, |state| {
            state.metadata.get("sig").map(|v| v.to_string()).unwrap_or_default()
        });
        let mut state = StateSchema::new("t", 10);
        state.metadata.insert("sig".into(), serde_json::json!("a"));

        assert!(criteria.should_stop(&state, 0, &ctx(0.0)).is_none());
        assert!(criteria.should_stop(&state, 1, &ctx(0.0)).is_none());
        let hit = criteria.should_stop(&state, 2, &ctx(0.0)).unwrap();
        assert_eq!(hit.reason, StopReason::Stagnation);

        state.metadata.insert("sig".into(), serde_json::json!("b"));
        let mut criteria = StagnationCriteria::with_signature(2, |state| {
            state.metadata.get("sig").map(|v| v.to_string()).unwrap_or_default()
        });
        assert!(criteria.should_stop(&state, 0, &ctx(0.0)).is_none());
        state.metadata.insert("sig".into(), serde_json::json!("c"));
        assert!(criteria.should_stop(&state, 1, &ctx(0.0)).is_none());
    }
}
