//! Values produced by user code and their deterministic text rendering.
//!
//! Invoke results and variable reads travel to the host as rendered text:
//! strings and chars are quoted with control characters escaped, arrays show
//! element type, length and rank followed by their rendered items, and
//! everything else uses its default textual form.

use std::fmt::{self, Write as _};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Array {
        /// Component type, e.g. `int` for `int[]`, `int[]` for `int[][]`.
        element_type: String,
        items: Vec<Value>,
    },
    /// Any other object, already in its default textual form.
    Object(String),
}

impl Value {
    pub fn array(element_type: impl Into<String>, items: Vec<Value>) -> Self {
        Self::Array {
            element_type: element_type.into(),
            items,
        }
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Convert a JSON value. Arrays get the narrowest element type that
    /// covers every item, `Object` otherwise.
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Self::Str(s.clone()),
            Json::Array(items) => {
                let items: Vec<Value> = items.iter().map(Self::from_json).collect();
                let element_type = common_type(&items);
                Self::Array {
                    element_type,
                    items,
                }
            }
            Json::Object(_) => Self::Object(json.to_string()),
        }
    }

    fn type_name(&self) -> String {
        match self {
            Self::Null | Self::Object(_) => "Object".to_string(),
            Self::Bool(_) => "boolean".to_string(),
            Self::Int(_) => "long".to_string(),
            Self::Float(_) => "double".to_string(),
            Self::Char(_) => "char".to_string(),
            Self::Str(_) => "String".to_string(),
            Self::Array { element_type, .. } => format!("{element_type}[]"),
        }
    }
}

fn common_type(items: &[Value]) -> String {
    let mut types = items.iter().map(Value::type_name);
    let Some(first) = types.next() else {
        return "Object".to_string();
    };
    if types.all(|t| t == first) {
        first
    } else {
        "Object".to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) if x.is_infinite() => {
                f.write_str(if *x > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Char(c) => {
                f.write_char('\'')?;
                write_escaped(f, *c)?;
                f.write_char('\'')
            }
            Self::Str(s) => f.write_str(&quote(s)),
            Self::Array {
                element_type,
                items,
            } => {
                let base = element_type.trim_end_matches("[]");
                let rank = (element_type.len() - base.len()) / 2;
                write!(f, "{base}[{}]{} {{ ", items.len(), "[]".repeat(rank))?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(" }")
            }
            Self::Object(text) => f.write_str(text),
        }
    }
}

/// Double-quote `s`, escaping control characters.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        // Writing to a String cannot fail.
        let _ = write_escaped(&mut out, c);
    }
    out.push('"');
    out
}

fn write_escaped(out: &mut impl fmt::Write, c: char) -> fmt::Result {
    match c {
        '\u{8}' => out.write_str("\\b"),
        '\u{c}' => out.write_str("\\f"),
        '\n' => out.write_str("\\n"),
        '\r' => out.write_str("\\r"),
        '\t' => out.write_str("\\t"),
        '\'' => out.write_str("\\'"),
        '"' => out.write_str("\\\""),
        '\\' => out.write_str("\\\\"),
        c if (c as u32) < 32 || c as u32 == 127 => write!(out, "\\{:03o}", c as u32),
        c => out.write_char(c),
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
