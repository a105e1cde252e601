use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extract::coerce_int;

/// One model's verdict on one candidate. Presence means "selected".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub candidate_id: usize,
    pub category: Option<String>,
    pub reason: Option<String>,
}

impl Decision {
    pub fn select(candidate_id: usize) -> Self {
        Self {
            candidate_id,
            category: None,
            reason: None,
        }
    }

    pub fn with_note(candidate_id: usize, category: &str, reason: &str) -> Self {
        Self {
            candidate_id,
            category: Some(category.to_string()),
            reason: Some(reason.to_string()),
        }
    }

    /// Interpret one list element: a bare id, or an object with an `id` field.
    /// Negative, fractional or missing ids yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let id = map.get("id").and_then(coerce_int)?;
                let text = |key: &str| {
                    map.get(key)
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                };
                Some(Self {
                    candidate_id: usize::try_from(id).ok()?,
                    category: text("category"),
                    reason: text("reason"),
                })
            }
            other => {
                let id = coerce_int(other)?;
                usize::try_from(id).ok().map(Self::select)
            }
        }
    }
}

/// Parse every usable decision from a reply list, preserving order.
pub fn parse_decisions(items: &[Value]) -> Vec<Decision> {
    items.iter().filter_map(Decision::from_value).collect()
}
