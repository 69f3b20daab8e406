//! Operator signatures.
//!
//! A [`Signature`] renders as a schema string such as
//! `aten::add(int a, int b) -> int`. The schema string is how a built-in call
//! names its operator on the wire, so two signatures with the same name but
//! different parameters stay distinguishable.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of value a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Int,
    Float,
    Bool,
    Str,
    List,
    Blob,
    Any,
}

impl ArgKind {
    /// Convert `value` to this kind, or `None` if it does not fit.
    ///
    /// Ints widen to floats; no other conversion happens.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ArgKind::Any, v) => Some(v.clone()),
            (ArgKind::Int, Value::Int(_))
            | (ArgKind::Float, Value::Float(_))
            | (ArgKind::Bool, Value::Bool(_))
            | (ArgKind::Str, Value::Str(_))
            | (ArgKind::List, Value::List(_))
            | (ArgKind::Blob, Value::Blob(_)) => Some(value.clone()),
            (ArgKind::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
            _ => None,
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArgKind::Int => "int",
            ArgKind::Float => "float",
            ArgKind::Bool => "bool",
            ArgKind::Str => "str",
            ArgKind::List => "list",
            ArgKind::Blob => "blob",
            ArgKind::Any => "Any",
        };
        f.write_str(s)
    }
}

/// One declared parameter of an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub kind: ArgKind,
    /// Value bound when the caller supplies nothing for this parameter.
    #[serde(default)]
    pub default: Option<Value>,
}

impl Argument {
    pub fn required(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ArgKind, default: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Some(default),
        }
    }
}

/// Declared signature of a built-in operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Qualified name, e.g. `aten::add`.
    pub name: String,
    pub arguments: Vec<Argument>,
    pub returns: ArgKind,
}

impl Signature {
    pub fn new(name: impl Into<String>, arguments: Vec<Argument>, returns: ArgKind) -> Self {
        Self {
            name: name.into(),
            arguments,
            returns,
        }
    }

    /// The schema string that identifies this signature on the wire.
    pub fn schema(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", arg.kind, arg.name)?;
            if let Some(default) = &arg.default {
                write!(f, "={default}")?;
            }
        }
        write!(f, ") -> {}", self.returns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_string() {
        let sig = Signature::new(
            "aten::add",
            vec![
                Argument::required("a", ArgKind::Int),
                Argument::required("b", ArgKind::Int),
            ],
            ArgKind::Int,
        );
        assert_eq!(sig.schema(), "aten::add(int a, int b) -> int");
    }

    #[test]
    fn test_schema_string_with_default() {
        let sig = Signature::new(
            "aten::mul",
            vec![
                Argument::required("a", ArgKind::Float),
                Argument::optional("scale", ArgKind::Float, Value::Float(1.0)),
            ],
            ArgKind::Float,
        );
        assert_eq!(sig.schema(), "aten::mul(float a, float scale=1.0) -> float");
    }

    #[test]
    fn test_coerce() {
        assert_eq!(ArgKind::Float.coerce(&Value::Int(2)), Some(Value::Float(2.0)));
        assert_eq!(ArgKind::Int.coerce(&Value::Float(2.0)), None);
        assert_eq!(ArgKind::Int.coerce(&Value::from("x")), None);
        assert_eq!(ArgKind::Any.coerce(&Value::None), Some(Value::None));
    }
}
