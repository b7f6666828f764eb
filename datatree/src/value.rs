//! The runtime value type flowing through the extraction pipeline.
//!
//! Every stage of the pipeline (source select, calc, type coercion, linking)
//! consumes and produces [`Value`]. JSON scalars map onto it directly;
//! the temporal variants are only ever produced by type coercion.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single extracted value.
///
/// `Filtered` is the in-band sentinel produced by the membership filter;
/// it never appears in emitted records because any record holding one is
/// dropped before the link stage completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string.
    String(String),
    /// An ordered list of values.
    List(Vec<Value>),
    /// An ordered map of named values.
    Map(IndexMap<String, Value>),
    /// An instant in UTC.
    DateTime(DateTime<Utc>),
    /// A calendar date.
    Date(NaiveDate),
    /// A wall-clock time.
    Time(NaiveTime),
    /// A span of whole seconds.
    Duration(i64),
    /// Membership-filter sentinel: the enclosing record must be dropped.
    Filtered,
}

impl Value {
    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this is the membership-filter sentinel.
    pub fn is_filtered(&self) -> bool {
        matches!(self, Value::Filtered)
    }

    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce to an integer the way the calc stages do: integers pass,
    /// floats truncate, booleans map to 0/1, and strings parse after
    /// trimming. Everything else is rejected.
    pub fn to_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Coerce to a float, accepting the same inputs as [`Value::to_int`].
    pub fn to_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Truthiness as the boolean coercion defines it: booleans pass through,
    /// numbers are true above zero, strings are true when non-empty and not
    /// `"0"`, everything else is false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n > 0,
            Value::Float(f) => *f > 0.0,
            Value::String(s) => !s.is_empty() && s != "0",
            _ => false,
        }
    }

    /// Render the value as display text.
    ///
    /// Strings pass through unquoted; temporal values render in ISO form;
    /// lists and maps render their parts comma-joined.
    pub fn render(&self) -> String {
        match self {
            Value::Null | Value::Filtered => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(","),
            Value::Map(entries) => entries
                .values()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(","),
            Value::DateTime(dt) => dt.to_rfc3339(),
            Value::Date(d) => d.to_string(),
            Value::Time(t) => t.to_string(),
            Value::Duration(secs) => secs.to_string(),
        }
    }

    /// Convert from a parsed JSON value.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert into a JSON value for record output.
    ///
    /// Temporal values render as their ISO strings; `Filtered` becomes null
    /// (it only appears here if a caller serializes intermediate state).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Filtered => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::DateTime(_) | Value::Date(_) | Value::Time(_) => {
                serde_json::Value::String(self.render())
            }
            Value::Duration(secs) => serde_json::Value::from(*secs),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_scalars() {
        let json: serde_json::Value = serde_json::from_str(r#"{"a": 1, "b": "x", "c": null}"#)
            .expect("fixture must parse");
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn int_coercion() {
        assert_eq!(Value::from(" 12 ").to_int(), Some(12));
        assert_eq!(Value::Float(3.9).to_int(), Some(3));
        assert_eq!(Value::Bool(true).to_int(), Some(1));
        assert_eq!(Value::Null.to_int(), None);
    }

    #[test]
    fn truthiness_matches_boolean_coercion() {
        assert!(Value::from("yes").truthy());
        assert!(!Value::from("0").truthy());
        assert!(!Value::from("").truthy());
        assert!(Value::Int(2).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Null.truthy());
    }

    #[test]
    fn render_joins_lists() {
        let value = Value::List(vec![Value::from("a"), Value::Int(2)]);
        assert_eq!(value.render(), "a,2");
    }
}
