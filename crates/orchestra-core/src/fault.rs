//! Domain-level faults.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the catch-all fault handler.
pub const DEFAULT_HANDLER_NAME: &str = "default";
/// Raised when a value does not match its declared type.
pub const TYPE_MISMATCH_FAULT_NAME: &str = "TypeMismatch";
/// Raised when a collaborator reports an I/O failure.
pub const IO_EXCEPTION_FAULT_NAME: &str = "IOException";
/// Raised when a waiter outlives its deadline.
pub const TIMEOUT_FAULT_NAME: &str = "Timeout";
/// Sent back to the caller when a message matches no session and no starter.
pub const CORRELATION_ERROR_FAULT_NAME: &str = "CorrelationError";

/// A fault raised by a session's own logic.
///
/// Faults travel through scope-stack unwinding and are recovered by the
/// nearest handler; only faults without any handler reach the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("fault `{name}`")]
pub struct Fault {
    /// Fault name, matched against installed handler names.
    pub name: String,
    /// Payload carried by the fault.
    #[serde(default)]
    pub value: Value,
}

impl Fault {
    /// Create a fault without payload.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
        }
    }

    /// Create a fault carrying `value`.
    #[must_use]
    pub fn with_value(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Fault delivered to a waiter whose deadline expired.
    #[must_use]
    pub fn timeout(operation: &str) -> Self {
        Self::with_value(
            TIMEOUT_FAULT_NAME,
            Value::String(format!("Timed out waiting for operation {operation}")),
        )
    }

    /// Fault answered to a message that cannot be routed anywhere.
    #[must_use]
    pub fn correlation_error() -> Self {
        Self::with_value(
            CORRELATION_ERROR_FAULT_NAME,
            Value::String(
                "The message you sent can not be correlated with any session and can not be used to start a new session."
                    .to_string(),
            ),
        )
    }
}
