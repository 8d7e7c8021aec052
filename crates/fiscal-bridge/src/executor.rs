//! The seam between the dispatcher and whatever drives the hardware.
//!
//! An [`OperationExecutor`] is synchronous on purpose: device drivers block.
//! The dispatcher runs it on the blocking pool so the async runtime keeps
//! serving other devices while one register prints.

use fiscal_types::Arguments;
use serde_json::{Value, json};
use thiserror::Error;

/// Successful result of one operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    pub data: Option<Value>,
    pub message: Option<String>,
}

impl ExecutionOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Why an operation failed.  The `Display` text is sent back verbatim as the
/// failure message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("missing argument '{0}'")]
    MissingArgument(String),

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// The register itself refused the command.
    #[error("{description}")]
    Device { code: i64, description: String },

    #[error("{0}")]
    Other(String),
}

impl ExecutionError {
    pub fn device(code: i64, description: impl Into<String>) -> Self {
        ExecutionError::Device {
            code,
            description: description.into(),
        }
    }

    /// Structured detail attached to the failure response, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            ExecutionError::Device { code, description } => Some(json!({
                "error_code": code,
                "description": description,
            })),
            _ => None,
        }
    }
}

/// Executes named operations against one device.
pub trait OperationExecutor: Send + Sync + 'static {
    fn execute(&self, operation: &str, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError>;
}

impl<F> OperationExecutor for F
where
    F: Fn(&str, &Arguments) -> Result<ExecutionOutput, ExecutionError> + Send + Sync + 'static,
{
    fn execute(&self, operation: &str, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self(operation, arguments)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Argument helpers
// ────────────────────────────────────────────────────────────────────────────

pub fn required<'a>(arguments: &'a Arguments, name: &str) -> Result<&'a Value, ExecutionError> {
    arguments
        .get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ExecutionError::MissingArgument(name.to_string()))
}

pub fn required_str<'a>(arguments: &'a Arguments, name: &str) -> Result<&'a str, ExecutionError> {
    required(arguments, name)?
        .as_str()
        .ok_or_else(|| invalid(name, "expected a string"))
}

pub fn required_f64(arguments: &Arguments, name: &str) -> Result<f64, ExecutionError> {
    required(arguments, name)?
        .as_f64()
        .ok_or_else(|| invalid(name, "expected a number"))
}

pub fn optional_str<'a>(arguments: &'a Arguments, name: &str) -> Result<Option<&'a str>, ExecutionError> {
    match arguments.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| invalid(name, "expected a string")),
    }
}

pub fn optional_i64(arguments: &Arguments, name: &str) -> Result<Option<i64>, ExecutionError> {
    match arguments.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid(name, "expected an integer")),
    }
}

pub fn optional_bool(arguments: &Arguments, name: &str) -> Result<Option<bool>, ExecutionError> {
    match arguments.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(name, "expected a boolean")),
    }
}

fn invalid(name: &str, reason: &str) -> ExecutionError {
    ExecutionError::InvalidArgument {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn device_error_displays_description_only() {
        let err = ExecutionError::device(44, "out of paper");
        assert_eq!(err.to_string(), "out of paper");
        assert_eq!(
            err.details(),
            Some(json!({"error_code": 44, "description": "out of paper"}))
        );
        assert_eq!(ExecutionError::Other("x".into()).details(), None);
    }

    #[test]
    fn closures_are_executors() {
        let exec = |op: &str, _: &Arguments| -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput::message(op.to_uppercase()))
        };
        let out = exec.execute("ping", &Arguments::new()).unwrap();
        assert_eq!(out.message.as_deref(), Some("PING"));
    }

    #[test]
    fn argument_helpers() {
        let a = args(json!({"name": "milk", "price": 1.5, "qty": 2, "flag": true, "none": null}));
        assert_eq!(required_str(&a, "name").unwrap(), "milk");
        assert_eq!(required_f64(&a, "price").unwrap(), 1.5);
        assert_eq!(optional_i64(&a, "qty").unwrap(), Some(2));
        assert_eq!(optional_bool(&a, "flag").unwrap(), Some(true));
        assert_eq!(optional_str(&a, "none").unwrap(), None);

        assert_eq!(
            required_str(&a, "missing"),
            Err(ExecutionError::MissingArgument("missing".into()))
        );
        assert!(matches!(
            required_f64(&a, "name"),
            Err(ExecutionError::InvalidArgument { .. })
        ));
    }
}
