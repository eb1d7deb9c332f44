//! ReAct-style text parser with configurable keyword aliases.
//!
//! Line-oriented: `Label:` headers split the output into blocks. A final
//! block wins over an action block; the action payload is a function-call
//! literal handled by the balanced-parentheses scanner.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::func::parse_action_any;
use super::{ParseError, Parser};
use crate::action::Action;
use crate::decision::Decision;

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?im)^\s*([A-Za-z][A-Za-z _-]{0,40})\s*:\s*").unwrap())
}

/// Normalize a keyword for alias comparison: lowercase, spaces/underscores/
/// dashes removed (`Final Answer` == `final_answer` == `finalanswer`).
fn norm(token: &str) -> String {
    token
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect()
}

fn extract_labeled_blocks(text: &str) -> Vec<(String, String)> {
    let matches: Vec<_> = label_pattern().captures_iter(text).collect();
    let mut blocks = Vec::new();
    for (i, capture) in matches.iter().enumerate() {
        let key = norm(capture.get(1).map(|m| m.as_str()).unwrap_or_default());
        let start = capture.get(0).map(|m| m.end()).unwrap_or(0);
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let value = text[start..end].trim().to_string();
        if !key.is_empty() && !value.is_empty() {
            blocks.push((key, value));
        }
    }
    blocks
}

fn first_block_value<'a>(blocks: &'a [(String, String)], keys: &[String]) -> Option<&'a str> {
    keys.iter().find_map(|key| {
        blocks
            .iter()
            .find(|(block_key, _)| block_key == key)
            .map(|(_, value)| value.as_str())
    })
}

/// Text parser for ReAct-style output (`Thought:` / `Action:` /
/// `Final Answer:`), keyword aliases configurable per block kind.
pub struct ReActTextParser {
    thought_keys: Vec<String>,
    reflection_keys: Vec<String>,
    action_keys: Vec<String>,
    final_keys: Vec<String>,
}

impl Default for ReActTextParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReActTextParser {
    pub fn new() -> Self {
        Self {
            thought_keys: to_norm(&["thought", "thinking", "think", "rationale"]),
            reflection_keys: to_norm(&["reflection", "reflect", "self_reflection"]),
            action_keys: to_norm(&["action", "tool", "call"]),
            final_keys: to_norm(&["final_answer", "final", "answer"]),
        }
    }

    pub fn with_action_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.action_keys = keys.into_iter().map(|k| norm(k.as_ref())).collect();
        self
    }

    pub fn with_final_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.final_keys = keys.into_iter().map(|k| norm(k.as_ref())).collect();
        self
    }
}

fn to_norm(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| norm(k)).collect()
}

impl Parser for ReActTextParser {
    fn parse(
        &self,
        raw_output: &str,
        _context: Option<&Map<String, Value>>,
    ) -> Result<Decision, ParseError> {
        let text = raw_output.trim();
        if text.is_empty() {
            return Err(ParseError::EmptyOutput);
        }

        let blocks = extract_labeled_blocks(text);
        let thought = first_block_value(&blocks, &self.thought_keys);
        let reflection = first_block_value(&blocks, &self.reflection_keys);
        let final_answer = first_block_value(&blocks, &self.final_keys);
        let action_blob = first_block_value(&blocks, &self.action_keys);

        let mut meta = Map::new();
        if let Some(reflection) = reflection {
            meta.insert("reflection".into(), Value::String(reflection.to_string()));
        }

        if let Some(answer) = final_answer {
            let mut decision = Decision::final_answer(answer).with_meta(meta);
            if let Some(thought) = thought {
                decision = decision.with_rationale(thought);
            }
            decision.validate()?;
            return Ok(decision);
        }

        let parsed = parse_action_any(action_blob.unwrap_or(text));
        if let Some((name, args)) = parsed {
            let mut decision =
                Decision::act(vec![Action::new(name).with_args(args)]).with_meta(meta);
            if let Some(thought) = thought {
                decision = decision.with_rationale(thought);
            }
            decision.validate()?;
            return Ok(decision);
        }
        Err(ParseError::NoDecision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: an Action block produces an act decision with coerced args.
    #[test]
    fn parse_action_block() {
        let parser = ReActTextParser::new();
        let decision = parser
            .parse("Thought: I should add.\nAction: add(a=20, b=22)", None)
            .unwrap();
        assert_eq!(decision.mode(), "act");
        assert_eq!(decision.actions()[0].name, "add");
        assert_eq!(decision.actions()[0].args["a"], json!(20));
        assert_eq!(decision.rationale(), Some("I should add."));
    }

    /// **Scenario**: a Final Answer block wins over a later Action block.
    #[test]
    fn final_answer_wins() {
        let parser = ReActTextParser::new();
        let decision = parser
            .parse("Final Answer: 42\nAction: add(a=1, b=1)", None)
            .unwrap();
        assert_eq!(decision.final_text(), Some("42"));
    }

    /// **Scenario**: keyword aliases normalize case, spaces and underscores.
    #[test]
    fn alias_normalization() {
        let parser = ReActTextParser::new();
        let decision = parser.parse("FINAL_ANSWER: done", None).unwrap();
        assert_eq!(decision.final_text(), Some("done"));

        let decision = parser.parse("final answer: also done", None).unwrap();
        assert_eq!(decision.final_text(), Some("also done"));
    }

    /// **Scenario**: a reflection block lands in decision meta.
    #[test]
    fn reflection_into_meta() {
        let parser = ReActTextParser::new();
        let decision = parser
            .parse(
                "Reflection: last call failed\nAction: retry_tool(attempt=2)",
                None,
            )
            .unwrap();
        assert_eq!(decision.meta()["reflection"], json!("last call failed"));
    }

    /// **Scenario**: a bare function call with no labels still parses.
    #[test]
    fn bare_function_call() {
        let parser = ReActTextParser::new();
        let decision = parser.parse("add(a=40, b=2)", None).unwrap();
        assert_eq!(decision.actions()[0].name, "add");
    }

    /// **Scenario**: empty and unrecognizable output are parse errors.
    #[test]
    fn parse_failures() {
        let parser = ReActTextParser::new();
        assert!(matches!(parser.parse("  ", None), Err(ParseError::EmptyOutput)));
        assert!(matches!(
            parser.parse("just some prose with no markers", None),
            Err(ParseError::NoDecision)
        ));
    }
}
