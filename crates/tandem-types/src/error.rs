//! Shared error types for tandem.

use crate::ids::WorkerId;
use crate::value::Value;
use thiserror::Error;

/// Top-level error type for calls made through tandem.
#[derive(Error, Debug)]
pub enum TandemError {
    /// No registered built-in operator accepts the given arguments.
    #[error(
        "Failed to match operator name {name} and arguments (args: ({}), kwargs: {{{}}}) to a builtin operator",
        render_args(.args),
        render_kwargs(.kwargs)
    )]
    NoMatchingOperator {
        /// The name the caller asked for.
        name: String,
        /// Positional arguments as received.
        args: Vec<Value>,
        /// Keyword arguments as received.
        kwargs: Vec<(String, Value)>,
    },

    /// A reference-producing call targeted the calling worker itself.
    #[error("Does not support creating RRef on self yet ({0})")]
    SelfReferenceUnsupported(WorkerId),

    /// The destination's computation failed.
    #[error("Remote error: {0}")]
    RemoteError(String),

    /// A response carried a message type this worker cannot interpret.
    #[error("Unrecognized response message type {0}")]
    UnrecognizedResponseType(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TandemError {
    /// Whether the error signals protocol corruption or version skew rather
    /// than a failed call. In-flight work must be abandoned on a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TandemError::UnrecognizedResponseType(_))
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(e: serde_json::Error) -> Self {
        TandemError::Serialization(e.to_string())
    }
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_kwargs(kwargs: &[(String, Value)]) -> String {
    kwargs
        .iter()
        .map(|(k, v)| format!("{k:?}: {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Alias for Result with TandemError.
pub type TandemResult<T> = Result<T, TandemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_matching_operator_lists_arguments() {
        let err = TandemError::NoMatchingOperator {
            name: "add".to_string(),
            args: vec![Value::Int(2), Value::from("x")],
            kwargs: vec![("alpha".to_string(), Value::Int(1))],
        };
        let msg = err.to_string();
        assert!(msg.contains("add"));
        assert!(msg.contains(r#"(args: (2, "x"), kwargs: {"alpha": 1})"#), "{msg}");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_only_unrecognized_type_is_fatal() {
        assert!(TandemError::UnrecognizedResponseType("ScriptCall".into()).is_fatal());
        assert!(!TandemError::RemoteError("boom".into()).is_fatal());
        assert!(!TandemError::SelfReferenceUnsupported(WorkerId(0)).is_fatal());
    }
}
