use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Keyword arguments for a device operation, kept in insertion order.
pub type Arguments = Map<String, Value>;

/// Message used when a worker reports failure without saying why.
pub const UNKNOWN_WORKER_ERROR: &str = "Unknown error from worker";

/// Opaque token linking one outgoing command to its single reply.
///
/// Generated ids are UUIDv4 strings, but any string received from the wire is
/// accepted so replies from foreign workers can still be matched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A named operation addressed to one device. Exactly one envelope is
/// published per logical call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: CommandId,
    /// Operation name, e.g. `"shift_open"`.
    pub command: String,
    /// Empty when sent by legacy single-device clients.
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub kwargs: Arguments,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(device_id: impl Into<String>, command: impl Into<String>, kwargs: Arguments) -> Self {
        Self {
            command_id: CommandId::new(),
            command: command.into(),
            device_id: device_id.into(),
            kwargs,
            created_at: Utc::now(),
        }
    }
}

/// The worker's answer to one [`CommandEnvelope`].
///
/// `message` and `data` are always written (as `null` when absent) so that
/// every worker generation produces the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub command_id: CommandId,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Terminal outcome carried by a [`ResponseEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl ResponseEnvelope {
    pub fn success(command_id: CommandId, data: Option<Value>, message: Option<String>) -> Self {
        Self {
            command_id,
            success: true,
            message,
            data,
        }
    }

    pub fn failure(command_id: CommandId, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            command_id,
            success: false,
            message: Some(message.into()),
            data,
        }
    }

    pub fn outcome(&self) -> Outcome {
        if self.success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Everything that can go wrong between a caller and a device.
///
/// Only `TransportUnavailable`, `Timeout` and `WorkerReportedFailure` ever
/// reach a caller of the correlator; the remaining variants are internal and
/// are logged or converted at the boundary where they occur.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error(
        "Timed out after {timeout_ms} ms waiting for '{operation}' on device '{device_id}' (command {command_id})"
    )]
    Timeout {
        device_id: String,
        operation: String,
        command_id: CommandId,
        timeout_ms: u64,
    },

    #[error("{message}")]
    WorkerReportedFailure {
        message: String,
        data: Option<Value>,
    },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Executor panicked: {0}")]
    ExecutorPanic(String),
}

impl BridgeError {
    /// Build a worker failure from a failed [`ResponseEnvelope`].
    pub fn from_failed_response(response: ResponseEnvelope) -> Self {
        BridgeError::WorkerReportedFailure {
            message: response
                .message
                .unwrap_or_else(|| UNKNOWN_WORKER_ERROR.to_string()),
            data: response.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_envelope_uses_wire_field_names() {
        let mut kwargs = Arguments::new();
        kwargs.insert("cashier_name".to_string(), json!("Ivanova"));
        let envelope = CommandEnvelope::new("kkt-1", "shift_open", kwargs);

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["command"], "shift_open");
        assert_eq!(value["device_id"], "kkt-1");
        assert_eq!(value["kwargs"]["cashier_name"], "Ivanova");
        assert_eq!(value["command_id"], envelope.command_id.as_str());
    }

    #[test]
    fn legacy_command_without_device_or_kwargs_parses() {
        let raw = r#"{"command_id":"abc","command":"shift_get_status"}"#;
        let envelope: CommandEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.command_id.as_str(), "abc");
        assert!(envelope.device_id.is_empty());
        assert!(envelope.kwargs.is_empty());
    }

    #[test]
    fn kwargs_keep_insertion_order() {
        let raw = r#"{"command_id":"x","command":"receipt_add_item","kwargs":{"name":"tea","price":1.5,"quantity":2,"tax_type":6}}"#;
        let envelope: CommandEnvelope = serde_json::from_str(raw).unwrap();
        let keys: Vec<&str> = envelope.kwargs.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["name", "price", "quantity", "tax_type"]);
    }

    #[test]
    fn response_envelope_always_writes_message_and_data() {
        let response = ResponseEnvelope::success(CommandId::from("id-1"), None, None);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"command_id": "id-1", "success": true, "message": null, "data": null}));
    }

    #[test]
    fn worker_failure_keeps_message_verbatim() {
        let raw = r#"{"command_id":"id-2","success":false,"message":"out of paper","data":{"error_code":44}}"#;
        let response: ResponseEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(response.outcome(), Outcome::Failure);

        let err = BridgeError::from_failed_response(response);
        assert_eq!(err.to_string(), "out of paper");
        assert!(matches!(
            err,
            BridgeError::WorkerReportedFailure { data: Some(ref d), .. } if d["error_code"] == 44
        ));
    }

    #[test]
    fn failure_without_message_gets_default_text() {
        let response = ResponseEnvelope {
            command_id: CommandId::from("id-3"),
            success: false,
            message: None,
            data: None,
        };
        let err = BridgeError::from_failed_response(response);
        assert_eq!(err.to_string(), UNKNOWN_WORKER_ERROR);
    }

    #[test]
    fn timeout_display_names_device_operation_and_id() {
        let err = BridgeError::Timeout {
            device_id: "kkt-7".to_string(),
            operation: "shift_close".to_string(),
            command_id: CommandId::from("c-9"),
            timeout_ms: 100,
        };
        let text = err.to_string();
        assert!(text.contains("kkt-7"));
        assert!(text.contains("shift_close"));
        assert!(text.contains("c-9"));
    }

    #[test]
    fn generated_command_ids_are_unique() {
        assert_ne!(CommandId::new(), CommandId::new());
    }
}
