//! Planning helpers for planner-executor style agents.

use std::sync::OnceLock;

use regex::Regex;

fn numbered_item() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)[.)]\s*(.+)$").unwrap())
}

/// Extract the items of a numbered plan (`1. step` / `2) step`) from model
/// output, one per line. Non-list lines are ignored.
pub fn parse_numbered_plan(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            numbered_item()
                .captures(line.trim())
                .and_then(|capture| capture.get(2))
                .map(|m| m.as_str().trim().to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: dotted and parenthesized numbering both parse; prose is skipped.
    #[test]
    fn parse_numbered_items() {
        let text = "Here is the plan:\n1. read the file\n2) edit the function\nnot a step\n3. run tests";
        let plan = parse_numbered_plan(text);
        assert_eq!(
            plan,
            vec![
                "read the file".to_string(),
                "edit the function".to_string(),
                "run tests".to_string(),
            ]
        );
    }

    /// **Scenario**: empty input yields an empty plan.
    #[test]
    fn parse_empty() {
        assert!(parse_numbered_plan("").is_empty());
        assert!(parse_numbered_plan("no numbering here").is_empty());
    }
}
