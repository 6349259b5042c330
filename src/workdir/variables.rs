use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::{ProvisionError, Result};

/// A single input variable for the external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variable {
    String(String),
    StringList(Vec<String>),
    Integer(i64),
}

impl Variable {
    /// Convert an untyped JSON value. Anything outside the three supported
    /// shapes is a serialization error.
    pub fn from_json(key: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Integer).ok_or_else(|| {
                ProvisionError::Serialization(format!(
                    "variable {key:?}: only integers are supported, got {n}"
                ))
            }),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(ProvisionError::Serialization(format!(
                        "variable {key:?}: list elements must be strings, got {}",
                        json_kind(other)
                    ))),
                })
                .collect::<Result<Vec<_>>>()
                .map(Self::StringList),
            other => Err(ProvisionError::Serialization(format!(
                "variable {key:?}: unsupported type {}",
                json_kind(other)
            ))),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::String(s) => render_string(s),
            Self::StringList(items) => {
                let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
                format!("[{}]", quoted.join(", "))
            }
            Self::Integer(n) => n.to_string(),
        }
    }
}

impl From<&str> for Variable {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Variable {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Variable {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for Variable {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<Vec<String>> for Variable {
    fn from(items: Vec<String>) -> Self {
        Self::StringList(items)
    }
}

/// Ordered variable set, rendered to the tool's variables file format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: BTreeMap<String, Variable>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Variable>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Variable> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build from a JSON object such as the body of an installer request.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            ProvisionError::Serialization(format!(
                "variables must be a JSON object, got {}",
                json_kind(value)
            ))
        })?;

        let mut vars = Self::new();
        for (key, raw) in object {
            validate_key(key)?;
            vars.entries.insert(key.clone(), Variable::from_json(key, raw)?);
        }
        Ok(vars)
    }

    /// Render as `key = value` lines.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        for (key, value) in &self.entries {
            validate_key(key)?;
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(&value.render());
            out.push('\n');
        }
        Ok(out)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "invalid variable name {key:?}"
        )))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Template sequences must not be interpolated by the tool.
fn escape_template(s: &str) -> String {
    s.replace("${", "$${").replace("%{", "%%{")
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in escape_template(s).chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// A heredoc value always ends with the newline before its closing marker,
/// so only newline-terminated strings can use one without changing bytes.
fn render_string(s: &str) -> String {
    match s.strip_suffix('\n') {
        Some(body) if !s.contains('\r') => heredoc(body),
        _ => quote(s),
    }
}

fn heredoc(body: &str) -> String {
    let mut delimiter = String::from("EOT");
    while body.lines().any(|line| line.trim() == delimiter) {
        delimiter.push('_');
    }
    format!("<<{delimiter}\n{}\n{delimiter}", escape_template(body))
}
