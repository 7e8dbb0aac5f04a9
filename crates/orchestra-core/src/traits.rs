//! Collaborator traits: response channels and monitoring.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Fault, message::Response};

/// Session identifier, assigned monotonically per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel a message arrived on, used to answer it.
///
/// Implemented by the transport layer.
#[async_trait]
pub trait ResponseChannel: Send + Sync {
    /// Send a response back to the caller.
    async fn send(&self, response: Response) -> Result<(), ChannelError>;
}

/// Receiver of session lifecycle events.
pub trait Monitor: Send + Sync {
    /// A session was spawned for `operation`.
    fn session_started(&self, operation: &str, session: SessionId);

    /// A session spawned for `operation` finished, with or without a fault.
    fn session_ended(&self, operation: &str, session: SessionId);

    /// A fault escaped every handler of `session`.
    fn unhandled_fault(&self, session: SessionId, fault: &Fault);
}

/// Monitor that reports through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn session_started(&self, operation: &str, session: SessionId) {
        tracing::info!(%session, operation, "Session started");
    }

    fn session_ended(&self, operation: &str, session: SessionId) {
        tracing::info!(%session, operation, "Session ended");
    }

    fn unhandled_fault(&self, session: SessionId, fault: &Fault) {
        tracing::info!(
            %session,
            fault = %fault.name,
            content = %fault.value,
            "Thrown unhandled fault"
        );
    }
}
