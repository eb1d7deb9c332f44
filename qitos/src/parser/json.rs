//! JSON decision parser: `{"mode": ..., ...}` with noise tolerance.

use serde_json::{Map, Value};

use super::func::parse_action_any;
use super::{ParseError, Parser};
use crate::action::Action;
use crate::decision::Decision;

/// Parses `{mode, actions|action, final_answer, rationale, meta}` payloads.
/// Leading/trailing noise around the outermost `{…}` is tolerated.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecisionParser;

impl JsonDecisionParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse an already-decoded JSON object.
    pub fn parse_value(&self, payload: &Value) -> Result<Decision, ParseError> {
        let object = payload
            .as_object()
            .ok_or_else(|| ParseError::Json("output must decode to an object".into()))?;
        let mode = object
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let rationale = object
            .get("rationale")
            .and_then(Value::as_str)
            .map(str::to_string);
        let meta = object
            .get("meta")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let decision = match mode.as_str() {
            "act" => {
                let actions = extract_actions(object);
                if actions.is_empty() {
                    return Err(ParseError::Malformed("act decision without actions".into()));
                }
                Decision::act(actions).with_meta(meta)
            }
            "final" => {
                let answer = object
                    .get("final_answer")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Decision::final_answer(answer).with_meta(meta)
            }
            "wait" => Decision::wait().with_meta(meta),
            other => return Err(ParseError::UnsupportedMode(other.to_string())),
        };
        let decision = match rationale {
            Some(text) => decision.with_rationale(text),
            None => decision,
        };
        decision.validate()?;
        Ok(decision)
    }
}

impl Parser for JsonDecisionParser {
    fn parse(
        &self,
        raw_output: &str,
        _context: Option<&Map<String, Value>>,
    ) -> Result<Decision, ParseError> {
        let text = raw_output.trim();
        if text.is_empty() {
            return Err(ParseError::EmptyOutput);
        }
        let payload = decode_object(text)?;
        self.parse_value(&payload)
    }
}

fn decode_object(text: &str) -> Result<Value, ParseError> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }
    // Tolerate prose around the outermost object.
    let start = text.find('{');
    let end = text.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value @ Value::Object(_)) =
                serde_json::from_str::<Value>(&text[start..=end])
            {
                return Ok(value);
            }
        }
    }
    Err(ParseError::Json("no decodable object found".into()))
}

fn extract_actions(object: &Map<String, Value>) -> Vec<Action> {
    if let Some(Value::Array(items)) = object.get("actions") {
        let mut actions = Vec::new();
        for item in items {
            match item {
                Value::Object(_) => {
                    let action = Action::from_value(item);
                    if !action.name.is_empty() {
                        actions.push(action);
                    }
                }
                Value::String(text) => {
                    if let Some((name, args)) = parse_action_any(text) {
                        actions.push(Action::new(name).with_args(args));
                    }
                }
                _ => {}
            }
        }
        if !actions.is_empty() {
            return actions;
        }
    }
    match object.get("action") {
        Some(value @ Value::Object(_)) => {
            let action = Action::from_value(value);
            if action.name.is_empty() {
                Vec::new()
            } else {
                vec![action]
            }
        }
        Some(Value::String(text)) => parse_action_any(text)
            .map(|(name, args)| vec![Action::new(name).with_args(args)])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
