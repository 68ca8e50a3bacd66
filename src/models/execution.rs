//! Execution request and result types.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Named parameters for one execution, keyed by placeholder name (without the leading `:`).
pub type Params = serde_json::Map<String, JsonValue>;

/// One result row: column name to value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// Result of one `execute` call. The shape follows the instruction's verb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Output {
    /// Fetched rows (possibly empty)
    Rows(Vec<Row>),
    /// A single value, e.g. the generated identifier of an insert
    Scalar(JsonValue),
    /// Decoded values or key names from the key-value backend
    List(Vec<JsonValue>),
    /// Nothing to return
    Empty,
}

impl Output {
    /// Rows of a `Rows` result.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Value of a `Scalar` result.
    pub fn scalar(&self) -> Option<&JsonValue> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Items of a `List` result.
    pub fn list(&self) -> Option<&[JsonValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Rows(rows) => rows.is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Scalar(_) => false,
            Self::Empty => true,
        }
    }

    /// Convert into a plain JSON value (rows and lists become arrays, `Empty` becomes null).
    pub fn into_json(self) -> JsonValue {
        match self {
            Self::Rows(rows) => JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect()),
            Self::Scalar(value) => value,
            Self::List(items) => JsonValue::Array(items),
            Self::Empty => JsonValue::Null,
        }
    }
}
