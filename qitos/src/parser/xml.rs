//! XML decision parser: `<decision mode="…">` documents.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

use super::{ParseError, Parser};
use crate::action::Action;
use crate::decision::Decision;

/// Parses `<decision mode="act|final|wait">` with `<action name=..>`
/// carrying `<arg name=..>value</arg>` children and `<final_answer>` text.
/// Argument values stay strings; coercion is the tool schema's concern.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlDecisionParser;

impl XmlDecisionParser {
    pub fn new() -> Self {
        Self
    }
}

fn attribute(start: &BytesStart<'_>, name: &str) -> Result<Option<String>, ParseError> {
    let found = start
        .try_get_attribute(name)
        .map_err(|e| ParseError::Xml(e.to_string()))?;
    match found {
        Some(attr) => {
            let value = attr
                .unescape_value()
                .map_err(|e| ParseError::Xml(e.to_string()))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

impl Parser for XmlDecisionParser {
    fn parse(
        &self,
        raw_output: &str,
        _context: Option<&Map<String, Value>>,
    ) -> Result<Decision, ParseError> {
        let text = raw_output.trim();
        if text.is_empty() {
            return Err(ParseError::EmptyOutput);
        }

        let mut reader = Reader::from_str(text);
        let mut mode: Option<String> = None;
        let mut saw_decision_root = false;
        let mut final_answer = String::new();
        let mut in_final = false;
        let mut action: Option<(String, Map<String, Value>)> = None;
        let mut current_arg: Option<String> = None;
        let mut arg_text = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => match start.name().as_ref() {
                    b"decision" => {
                        if mode.is_some() {
                            return Err(ParseError::Xml("nested <decision> tag".into()));
                        }
                        saw_decision_root = true;
                        mode = Some(attribute(&start, "mode")?.unwrap_or_default());
                    }
                    b"final_answer" => in_final = true,
                    b"action" => {
                        if action.is_none() {
                            let name = attribute(&start, "name")?.unwrap_or_default();
                            action = Some((name, Map::new()));
                        }
                    }
                    b"arg" => {
                        current_arg = attribute(&start, "name")?;
                        arg_text.clear();
                    }
                    _ => {}
                },
                Ok(Event::Empty(start)) => match start.name().as_ref() {
                    b"decision" => {
                        if mode.is_some() {
                            return Err(ParseError::Xml("nested <decision> tag".into()));
                        }
                        saw_decision_root = true;
                        mode = Some(attribute(&start, "mode")?.unwrap_or_default());
                    }
                    b"action" => {
                        if action.is_none() {
                            let name = attribute(&start, "name")?.unwrap_or_default();
                            action = Some((name, Map::new()));
                        }
                    }
                    // Self-closing <arg name=.../> carries an empty value.
                    b"arg" => {
                        if let (Some(name), Some((_, args))) =
                            (attribute(&start, "name")?, action.as_mut())
                        {
                            if !name.trim().is_empty() {
                                args.insert(name.trim().to_string(), Value::String(String::new()));
                            }
                        }
                    }
                    _ => {}
                },
                Ok(Event::Text(text_event)) => {
                    let unescaped = text_event
                        .unescape()
                        .map_err(|e| ParseError::Xml(e.to_string()))?;
                    if in_final {
                        final_answer.push_str(&unescaped);
                    } else if current_arg.is_some() {
                        arg_text.push_str(&unescaped);
                    }
                }
                Ok(Event::End(end)) => match end.name().as_ref() {
                    b"final_answer" => in_final = false,
                    b"arg" => {
                        if let (Some(name), Some((_, args))) =
                            (current_arg.take(), action.as_mut())
                        {
                            if !name.trim().is_empty() {
                                args.insert(
                                    name.trim().to_string(),
                                    Value::String(arg_text.trim().to_string()),
                                );
                            }
                        }
                        arg_text.clear();
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => return Err(ParseError::Xml(err.to_string())),
            }
        }

        if !saw_decision_root {
            return Err(ParseError::Xml("root tag must be <decision>".into()));
        }

        let decision = match mode.as_deref().map(str::trim).unwrap_or_default() {
            "final" => {
                let answer = final_answer.trim();
                if answer.is_empty() {
                    return Err(ParseError::Malformed(
                        "<final_answer> is required for final mode".into(),
                    ));
                }
                Decision::final_answer(answer)
            }
            "act" => {
                let Some((name, args)) = action else {
                    return Err(ParseError::Malformed(
                        "<action> is required for act mode".into(),
                    ));
                };
                if name.trim().is_empty() {
                    return Err(ParseError::Malformed(
                        "<action> requires a name attribute".into(),
                    ));
                }
                Decision::act(vec![Action::new(name.trim()).with_args(args)])
            }
            "wait" => Decision::wait(),
            other => return Err(ParseError::UnsupportedMode(other.to_string())),
        };
        decision.validate()?;
        Ok(decision)
    }
}
