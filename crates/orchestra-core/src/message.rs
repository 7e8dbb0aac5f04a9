//! Inbound messages and the responses sent back on their channel.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Fault, traits::ResponseChannel};

/// Message delivered by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Operation the message invokes.
    pub operation: String,
    /// Transport-assigned message id, echoed in the response.
    pub id: u64,
    /// Message content.
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(operation: impl Into<String>, id: u64, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            id,
            payload,
        }
    }

    /// Build the fault response for this message.
    #[must_use]
    pub fn fault_response(&self, fault: Fault) -> Response {
        Response {
            id: self.id,
            operation: self.operation.clone(),
            outcome: Outcome::Fault(fault),
        }
    }

    /// Build the successful response for this message.
    #[must_use]
    pub fn response(&self, value: Value) -> Response {
        Response {
            id: self.id,
            operation: self.operation.clone(),
            outcome: Outcome::Value(value),
        }
    }
}

/// Result carried by a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Outcome {
    /// Normal reply.
    Value(Value),
    /// Fault reply.
    Fault(Fault),
}

/// Response to a previously received message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub operation: String,
    pub outcome: Outcome,
}

impl Response {
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        matches!(self.outcome, Outcome::Fault(_))
    }
}

/// A message together with the channel it arrived on.
#[derive(Clone)]
pub struct SessionMessage {
    message: Message,
    channel: Arc<dyn ResponseChannel>,
}

impl SessionMessage {
    #[must_use]
    pub fn new(message: Message, channel: Arc<dyn ResponseChannel>) -> Self {
        Self { message, channel }
    }

    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Operation name of the wrapped message.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.message.operation
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<dyn ResponseChannel> {
        &self.channel
    }

    #[must_use]
    pub fn into_parts(self) -> (Message, Arc<dyn ResponseChannel>) {
        (self.message, self.channel)
    }
}

impl fmt::Debug for SessionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMessage")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
