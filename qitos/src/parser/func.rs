//! Function-invocation scanning for agent text output.
//!
//! Model output frequently carries an action as a function-call literal,
//! `tool(a=1, b="x")`, possibly truncated mid-stream. The scanner here walks
//! balanced parentheses while respecting quotes, escapes and nested
//! brackets, so argument values containing `,`/`(`/`)` survive intact.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn func_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_.]*)\s*\(").unwrap())
}

fn action_marker() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)Action(?:\s+\d+)?\s*:\s*").unwrap())
}

/// One extracted call: `(name, raw_args, complete)`. `complete` is false when
/// the closing parenthesis never arrived (truncated output); the tail is
/// still yielded best-effort.
pub fn extract_function_calls(code: &str) -> Vec<(String, String, bool)> {
    let mut calls = Vec::new();
    let mut pos = 0;
    let bytes = code.as_bytes();
    while pos < code.len() {
        let Some(found) = func_pattern().captures_at(code, pos) else {
            break;
        };
        let name = found.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let open = found.get(0).map(|m| m.end()).unwrap_or(code.len());

        let mut i = open;
        let mut depth = 1u32;
        let mut in_single = false;
        let mut in_double = false;
        let mut escape = false;
        while i < bytes.len() && depth > 0 {
            let c = bytes[i] as char;
            if escape {
                escape = false;
                i += 1;
                continue;
            }
            match c {
                '\\' => escape = true,
                '\'' if !in_double => in_single = !in_single,
                '"' if !in_single => in_double = !in_double,
                '(' if !in_single && !in_double => depth += 1,
                ')' if !in_single && !in_double => depth -= 1,
                _ => {}
            }
            i += 1;
        }

        if depth == 0 {
            calls.push((name, code[open..i - 1].trim().to_string(), true));
            pos = i;
        } else {
            calls.push((name, code[open..].trim().to_string(), false));
            break;
        }
    }
    calls
}

/// Split an argument string on top-level commas, leaving nested structures
/// and quoted text untouched.
pub fn split_args_robust(arg_str: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut paren = 0u32;
    let mut square = 0u32;
    let mut curly = 0u32;
    let mut in_single = false;
    let mut in_double = false;
    let mut escape = false;

    for c in arg_str.chars() {
        if escape {
            current.push(c);
            escape = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escape = true;
                continue;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
                continue;
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
                continue;
            }
            _ => {}
        }
        if !in_single && !in_double {
            match c {
                '(' => paren += 1,
                ')' => paren = paren.saturating_sub(1),
                '[' => square += 1,
                ']' => square = square.saturating_sub(1),
                '{' => curly += 1,
                '}' => curly = curly.saturating_sub(1),
                ',' if paren == 0 && square == 0 && curly == 0 => {
                    let item = current.trim().to_string();
                    if !item.is_empty() {
                        args.push(item);
                    }
                    current.clear();
                    continue;
                }
                _ => {}
            }
        }
        current.push(c);
    }

    let tail = current.trim().to_string();
    if !tail.is_empty() {
        args.push(tail);
    }
    args
}

/// Best-effort `key=value` parsing with primitive literal coercion.
/// Unparseable values pass through as strings.
pub fn parse_kwargs_loose(arg_str: &str) -> Map<String, Value> {
    let mut kwargs = Map::new();
    for item in split_args_robust(arg_str) {
        let Some((key, raw_value)) = item.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        kwargs.insert(key.to_string(), parse_value_loose(raw_value.trim()));
    }
    kwargs
}

/// Find the first `Action:` block and parse its function-call payload.
pub fn parse_first_action_invocation(text: &str) -> Option<(String, Map<String, Value>)> {
    for marker in action_marker().find_iter(text) {
        let chunk = &text[marker.end()..];
        if let Some((name, args, _complete)) = extract_function_calls(chunk).into_iter().next() {
            return Some((name, parse_kwargs_loose(&args)));
        }
    }
    None
}

/// Parse an action from any supported shape: a bare function-call literal,
/// an `Action:`-marked block, or a JSON object `{"name": ..., "args": ...}`.
pub(crate) fn parse_action_any(blob: &str) -> Option<(String, Map<String, Value>)> {
    let text = blob.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(parsed) = parse_first_action_invocation(&format!("Action: {text}")) {
        return Some(parsed);
    }
    if let Some(parsed) = parse_first_action_invocation(text) {
        return Some(parsed);
    }
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(text) {
        let name = object.get("name")?.as_str()?.to_string();
        let args = object
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        return Some((name, args));
    }
    None
}

fn parse_value_loose(value: &str) -> Value {
    // JSON covers numbers, booleans, null, double-quoted strings, arrays,
    // objects.
    if let Ok(parsed) = serde_json::from_str::<Value>(value) {
        return parsed;
    }
    // Python-flavored literals the model may emit.
    match value {
        "True" => return Value::Bool(true),
        "False" => return Value::Bool(false),
        "None" => return Value::Null,
        _ => {}
    }
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        let inner = &value[1..value.len() - 1];
        return Value::String(inner.replace("\\'", "'").replace("\\\"", "\""));
    }
    Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: nested quotes and brackets do not break the scan.
    #[test]
    fn extract_balanced_calls() {
        let calls =
            extract_function_calls(r#"search(query="rust (lang)", filters=["a,b", 2])"#);
        assert_eq!(calls.len(), 1);
        let (name, args, complete) = &calls[0];
        assert_eq!(name, "search");
        assert!(complete);
        assert!(args.contains("rust (lang)"));
    }

    /// **Scenario**: truncated output still yields a best-effort tail.
    #[test]
    fn extract_truncated_call() {
        let calls = extract_function_calls(r#"write(path="a.txt", content="unfinished"#);
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].2);
        assert!(calls[0].1.contains("unfinished"));
    }

    /// **Scenario**: top-level commas split; nested ones survive.
    #[test]
    fn split_respects_nesting() {
        let parts = split_args_robust(r#"a=1, b=[1, 2], c="x,y", d={"k": 1}"#);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1], "b=[1, 2]");
        assert_eq!(parts[2], r#"c="x,y""#);
    }

    /// **Scenario**: primitive literals coerce; unknown tokens pass through.
    #[test]
    fn kwargs_literal_coercion() {
        let kwargs = parse_kwargs_loose(
            r#"a=40, b=2.5, ok=true, py=True, none=None, s="hi", sq='there', raw=plain"#,
        );
        assert_eq!(kwargs["a"], json!(40));
        assert_eq!(kwargs["b"], json!(2.5));
        assert_eq!(kwargs["ok"], json!(true));
        assert_eq!(kwargs["py"], json!(true));
        assert_eq!(kwargs["none"], Value::Null);
        assert_eq!(kwargs["s"], json!("hi"));
        assert_eq!(kwargs["sq"], json!("there"));
        assert_eq!(kwargs["raw"], json!("plain"));
    }

    /// **Scenario**: the first Action marker wins, numbered markers included.
    #[test]
    fn first_action_invocation() {
        let text = "Thought: add them\nAction 1: add(a=40, b=2)\nAction 2: noop()";
        let (name, args) = parse_first_action_invocation(text).unwrap();
        assert_eq!(name, "add");
        assert_eq!(args["a"], json!(40));
        assert_eq!(args["b"], json!(2));

        assert!(parse_first_action_invocation("no markers here").is_none());
    }
}
