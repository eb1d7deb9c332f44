//! The decision contract: one step's intent.
//!
//! A [`Decision`] is what a policy (agent or parser) hands to the engine:
//! `act` with a batch of tool actions, `final` with the answer, `wait` to
//! consume a step without side effects, or `branch` with candidate decisions
//! for the search layer to resolve.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::Action;

/// Validation failure for a malformed decision.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecisionError {
    #[error("decision mode 'act' requires non-empty actions")]
    EmptyActions,
    #[error("decision mode 'final' requires a non-empty final_answer")]
    EmptyFinalAnswer,
    #[error("decision mode 'branch' requires candidates")]
    EmptyCandidates,
}

/// Discriminated union over decision mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Decision {
    Act {
        actions: Vec<Action>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        meta: Map<String, Value>,
    },
    Final {
        final_answer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        meta: Map<String, Value>,
    },
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        meta: Map<String, Value>,
    },
    Branch {
        candidates: Vec<Decision>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        meta: Map<String, Value>,
    },
}

impl Decision {
    pub fn act(actions: Vec<Action>) -> Self {
        Decision::Act {
            actions,
            rationale: None,
            meta: Map::new(),
        }
    }

    pub fn final_answer(answer: impl Into<String>) -> Self {
        Decision::Final {
            final_answer: answer.into(),
            rationale: None,
            meta: Map::new(),
        }
    }

    pub fn wait() -> Self {
        Decision::Wait {
            rationale: None,
            meta: Map::new(),
        }
    }

    pub fn branch(candidates: Vec<Decision>) -> Self {
        Decision::Branch {
            candidates,
            rationale: None,
            meta: Map::new(),
        }
    }

    pub fn with_rationale(mut self, text: impl Into<String>) -> Self {
        let slot = match &mut self {
            Decision::Act { rationale, .. }
            | Decision::Final { rationale, .. }
            | Decision::Wait { rationale, .. }
            | Decision::Branch { rationale, .. } => rationale,
        };
        *slot = Some(text.into());
        self
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        let slot = match &mut self {
            Decision::Act { meta, .. }
            | Decision::Final { meta, .. }
            | Decision::Wait { meta, .. }
            | Decision::Branch { meta, .. } => meta,
        };
        *slot = meta;
        self
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Decision::Act { .. } => "act",
            Decision::Final { .. } => "final",
            Decision::Wait { .. } => "wait",
            Decision::Branch { .. } => "branch",
        }
    }

    pub fn rationale(&self) -> Option<&str> {
        match self {
            Decision::Act { rationale, .. }
            | Decision::Final { rationale, .. }
            | Decision::Wait { rationale, .. }
            | Decision::Branch { rationale, .. } => rationale.as_deref(),
        }
    }

    pub fn meta(&self) -> &Map<String, Value> {
        match self {
            Decision::Act { meta, .. }
            | Decision::Final { meta, .. }
            | Decision::Wait { meta, .. }
            | Decision::Branch { meta, .. } => meta,
        }
    }

    /// Actions carried by an `act` decision; empty for every other mode.
    pub fn actions(&self) -> &[Action] {
        match self {
            Decision::Act { actions, .. } => actions,
            _ => &[],
        }
    }

    pub fn final_text(&self) -> Option<&str> {
        match self {
            Decision::Final { final_answer, .. } => Some(final_answer),
            _ => None,
        }
    }

    pub fn candidates(&self) -> &[Decision] {
        match self {
            Decision::Branch { candidates, .. } => candidates,
            _ => &[],
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Decision::Branch { .. })
    }

    /// Enforce per-mode required fields; branch candidates validate recursively.
    pub fn validate(&self) -> Result<(), DecisionError> {
        match self {
            Decision::Act { actions, .. } => {
                if actions.is_empty() {
                    return Err(DecisionError::EmptyActions);
                }
                Ok(())
            }
            Decision::Final { final_answer, .. } => {
                if final_answer.is_empty() {
                    return Err(DecisionError::EmptyFinalAnswer);
                }
                Ok(())
            }
            Decision::Wait { .. } => Ok(()),
            Decision::Branch { candidates, .. } => {
                if candidates.is_empty() {
                    return Err(DecisionError::EmptyCandidates);
                }
                for candidate in candidates {
                    candidate.validate()?;
                }
                Ok(())
            }
        }
    }
}
