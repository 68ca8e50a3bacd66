//! Instruction verbs for both backends.

use crate::error::EngineError;
use std::str::FromStr;

/// Classification of a SQL statement by its first token. Drives the result shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns the generated identifier
    Insert,
    /// Returns the fetched row set
    Update,
    /// Select, delete, DDL, transaction control and everything else; returns the fetched row set
    Other,
}

impl StatementKind {
    /// Classify a statement by its first whitespace-delimited token, case-insensitively.
    pub fn classify(sql: &str) -> Self {
        let first = sql.split_whitespace().next().unwrap_or_default();
        if first.eq_ignore_ascii_case("insert") {
            Self::Insert
        } else if first.eq_ignore_ascii_case("update") {
            Self::Update
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed verb set of the key-value backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvVerb {
    Get,
    Set,
    Del,
    Keys,
}

impl KvVerb {
    /// Whether the verb needs a `key` parameter.
    pub fn requires_key(&self) -> bool {
        !matches!(self, Self::Keys)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Del => "del",
            Self::Keys => "keys",
        }
    }
}

impl FromStr for KvVerb {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "set" => Ok(Self::Set),
            "del" => Ok(Self::Del),
            "keys" => Ok(Self::Keys),
            _ => Err(EngineError::precondition(format!(
                "instruction not found ({s})"
            ))),
        }
    }
}

impl std::fmt::Display for KvVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
