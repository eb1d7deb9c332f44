//! Parsers: raw model output in, validated [`Decision`] out.
//!
//! A parser never executes a tool and never mutates state; it only
//! translates. Failures are recoverable parse errors by taxonomy, so the
//! engine can re-observe and ask the model again.

mod func;
mod json;
mod react;
mod xml;

pub use func::{extract_function_calls, parse_first_action_invocation, parse_kwargs_loose};
pub use json::JsonDecisionParser;
pub use react::ReActTextParser;
pub use xml::XmlDecisionParser;

use serde_json::{Map, Value};

use crate::decision::{Decision, DecisionError};
use crate::error::RuntimeError;

/// Parse failure. Always classified recoverable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("empty model output")]
    EmptyOutput,
    #[error("invalid json output: {0}")]
    Json(String),
    #[error("invalid xml output: {0}")]
    Xml(String),
    #[error("unsupported decision mode: {0}")]
    UnsupportedMode(String),
    #[error("no action or final answer found")]
    NoDecision,
    #[error("malformed decision: {0}")]
    Malformed(String),
}

impl From<DecisionError> for ParseError {
    fn from(err: DecisionError) -> Self {
        ParseError::Malformed(err.to_string())
    }
}

impl From<ParseError> for RuntimeError {
    fn from(err: ParseError) -> Self {
        RuntimeError::Parse(err.to_string())
    }
}

/// Translator from raw model output to a validated decision.
pub trait Parser: Send + Sync {
    fn parse(
        &self,
        raw_output: &str,
        context: Option<&Map<String, Value>>,
    ) -> Result<Decision, ParseError>;
}
