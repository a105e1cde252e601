//! Recovery of JSON values from free-form model output.
//!
//! Models wrap their answers in code fences, prose, or leave trailing commas
//! behind. `extract_json` runs a fixed sequence of recovery strategies and the
//! first one that yields valid JSON wins. Nothing beyond JSON parsing is ever
//! applied to the text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)```(?:json)?").unwrap());
static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Keys commonly used by models to wrap the list they were asked for
const WRAPPER_KEYS: &[&str] = &[
    "clusters",
    "data",
    "result",
    "output",
    "selected",
    "selections",
    "ids",
    "items",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("no parseable JSON found in model output")]
    NotParseable,
}

/// A JSON reply whose shape has not been validated yet
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReply {
    Array(Vec<Value>),
    Object(Map<String, Value>),
    Scalar(Value),
}

impl From<Value> for ParsedReply {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => ParsedReply::Array(items),
            Value::Object(map) => ParsedReply::Object(map),
            other => ParsedReply::Scalar(other),
        }
    }
}

impl ParsedReply {
    /// Resolve the reply to a list, unwrapping `{"<key>": [...]}` envelopes.
    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            ParsedReply::Array(items) => Some(items),
            ParsedReply::Object(mut map) => {
                for key in WRAPPER_KEYS {
                    if matches!(map.get(*key), Some(Value::Array(_))) {
                        if let Some(Value::Array(items)) = map.remove(*key) {
                            return Some(items);
                        }
                    }
                }
                if map.len() == 1 {
                    if let Some(Value::Array(items)) = map.into_iter().next().map(|(_, v)| v) {
                        return Some(items);
                    }
                }
                None
            }
            ParsedReply::Scalar(_) => None,
        }
    }
}

/// Coerce a JSON value to an integer: integers, integral floats and numeric strings.
pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Recover a JSON value from raw model text.
pub fn extract_json(text: &str) -> Result<Value, ExtractError> {
    let stripped = CODE_FENCE.replace_all(text, "");
    let text = stripped.trim();
    if text.is_empty() {
        return Err(ExtractError::NotParseable);
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    if let Some(span) = balanced_span(text) {
        if let Some(value) = parse_with_repair(span) {
            return Ok(value);
        }
    }

    // Last resort: widest array-looking span
    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if end > start {
            if let Some(value) = parse_with_repair(&text[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(ExtractError::NotParseable)
}

/// Extract and classify in one step.
pub fn extract_reply(text: &str) -> Result<ParsedReply, ExtractError> {
    extract_json(text).map(ParsedReply::from)
}

fn parse_with_repair(span: &str) -> Option<Value> {
    serde_json::from_str(span).ok().or_else(|| {
        let cleaned = TRAILING_COMMA.replace_all(span, "$1");
        serde_json::from_str(&cleaned).ok()
    })
}

/// Span from the first `[`/`{` to its matching closer, skipping string literals.
/// Returns `None` on a mismatched closer or when the input ends first.
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let mut stack: Vec<char> = Vec::new();
    let mut in_str: Option<char> = None;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if let Some(quote) = in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_str = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => in_str = Some(ch),
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ']' | '}' => {
                if stack.pop()? != ch {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}
