//! Named parameter binding.
//!
//! Statements use `:name` placeholders. MySQL only understands positional `?`, so each
//! statement is rewritten once and the named values are laid out in placeholder order.
//! Placeholders inside quoted strings, quoted identifiers and comments are left alone.

use crate::error::{EngineError, EngineResult};
use crate::models::{Params, StatementKind};
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlArguments;
use sqlx::types::Json;
use sqlx::MySql;
use std::collections::HashSet;

/// A statement with its named placeholders rewritten to positional ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStatement {
    sql: String,
    names: Vec<String>,
    positional: usize,
}

/// A statement ready to run: positional SQL plus arguments in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub args: Vec<JsonValue>,
    pub kind: StatementKind,
}

impl NamedStatement {
    /// Rewrite `:name` placeholders to `?`, recording their names in order.
    pub fn parse(sql: &str) -> Self {
        let chars: Vec<char> = sql.chars().collect();
        let mut out = String::with_capacity(sql.len());
        let mut names = Vec::new();
        let mut positional = 0;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' | '"' | '`' => {
                    let end = skip_quoted(&chars, i);
                    out.extend(&chars[i..end]);
                    i = end;
                }
                '-' if chars.get(i + 1) == Some(&'-') => {
                    let end = skip_line(&chars, i);
                    out.extend(&chars[i..end]);
                    i = end;
                }
                '#' => {
                    let end = skip_line(&chars, i);
                    out.extend(&chars[i..end]);
                    i = end;
                }
                '/' if chars.get(i + 1) == Some(&'*') => {
                    let end = skip_block_comment(&chars, i);
                    out.extend(&chars[i..end]);
                    i = end;
                }
                '?' => {
                    positional += 1;
                    out.push(c);
                    i += 1;
                }
                ':' if is_name_start(chars.get(i + 1))
                    && (i == 0 || chars[i - 1] != ':') =>
                {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && is_name_char(chars[end]) {
                        end += 1;
                    }
                    names.push(chars[start..end].iter().collect());
                    out.push('?');
                    i = end;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }

        Self {
            sql: out,
            names,
            positional,
        }
    }

    /// Positional SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Placeholder names in order of appearance (repeats included).
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Lay out `params` in placeholder order.
    ///
    /// Every placeholder must have a value and every value must have a placeholder.
    /// Parameter keys may carry a leading `:`.
    pub fn bind(&self, params: &Params) -> EngineResult<BoundStatement> {
        if self.positional > 0 && !self.names.is_empty() {
            return Err(EngineError::binding(
                "Invalid parameter number: mixed named and positional parameters",
            ));
        }

        let normalized: Vec<(&str, &JsonValue)> = params
            .iter()
            .map(|(k, v)| (k.trim_start_matches(':'), v))
            .collect();

        let referenced: HashSet<&str> = self.names.iter().map(String::as_str).collect();
        if let Some((unknown, _)) = normalized.iter().find(|(k, _)| !referenced.contains(k)) {
            return Err(EngineError::binding(format!(
                "Invalid parameter number: parameter :{unknown} was not defined"
            )));
        }

        let args = self
            .names
            .iter()
            .map(|name| {
                normalized
                    .iter()
                    .find(|(k, _)| *k == name.as_str())
                    .map(|(_, v)| (*v).clone())
                    .ok_or_else(|| {
                        EngineError::binding(format!(
                            "Invalid parameter number: no value bound for :{name}"
                        ))
                    })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(BoundStatement {
            sql: self.sql.clone(),
            args,
            kind: StatementKind::classify(&self.sql),
        })
    }
}

fn is_name_start(c: Option<&char>) -> bool {
    matches!(c, Some(c) if c.is_ascii_alphabetic() || *c == '_')
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Index just past the quoted run starting at `start` (backslash and doubled-quote escapes).
fn skip_quoted(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if quote != '`' => i += 2,
            c if c == quote => {
                if chars.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }
    chars.len()
}

fn skip_line(chars: &[char], start: usize) -> usize {
    chars[start..]
        .iter()
        .position(|&c| c == '\n')
        .map(|p| start + p)
        .unwrap_or(chars.len())
}

fn skip_block_comment(chars: &[char], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

/// Bind a JSON parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q JsonValue,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(v) => query.bind(*v),
        JsonValue::Number(n) => {
            if let Some(v) = n.as_i64() {
                query.bind(v)
            } else if let Some(v) = n.as_u64() {
                query.bind(v)
            } else {
                query.bind(n.as_f64())
            }
        }
        JsonValue::String(v) => query.bind(v.as_str()),
        JsonValue::Array(_) | JsonValue::Object(_) => query.bind(Json(param)),
    }
}
