use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Eq,
    Ne,
    Contains,
    Prefix,
    Suffix,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Eq => "eq",
            Comparator::Ne => "ne",
            Comparator::Contains => "contains",
            Comparator::Prefix => "prefix",
            Comparator::Suffix => "suffix",
            Comparator::Gt => "gt",
            Comparator::Gte => "gte",
            Comparator::Lt => "lt",
            Comparator::Lte => "lte",
        }
    }

    /// Maps a human-syntax operator.
    pub fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "=" => Comparator::Eq,
            "!=" => Comparator::Ne,
            "~" | "~=" => Comparator::Contains,
            ">" => Comparator::Gt,
            ">=" => Comparator::Gte,
            "<" => Comparator::Lt,
            "<=" => Comparator::Lte,
            _ => return None,
        })
    }

    /// A missing field compares as the empty string and is never numeric.
    pub fn evaluate(self, actual: Option<&Value>, expected: &Value) -> bool {
        match self {
            Comparator::Gt | Comparator::Gte | Comparator::Lt | Comparator::Lte => {
                let (Some(lhs), Some(rhs)) = (actual.and_then(as_number), as_number(expected)) else {
                    return false;
                };
                match self {
                    Comparator::Gt => lhs > rhs,
                    Comparator::Gte => lhs >= rhs,
                    Comparator::Lt => lhs < rhs,
                    _ => lhs <= rhs,
                }
            }
            _ => {
                let lhs = actual.map(value_text).unwrap_or_default().to_lowercase();
                let rhs = value_text(expected).to_lowercase();
                match self {
                    Comparator::Eq => lhs == rhs,
                    Comparator::Ne => lhs != rhs,
                    Comparator::Contains => lhs.contains(&rhs),
                    Comparator::Prefix => lhs.starts_with(&rhs),
                    _ => lhs.ends_with(&rhs),
                }
            }
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Follows a `.`-separated path through nested objects.
pub fn lookup<'a>(record: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Strings without quotes, `null` as empty, everything else as compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub comparator: Comparator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, comparator: Comparator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            comparator,
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        self.comparator.evaluate(lookup(record, &self.field), &self.value)
    }
}
