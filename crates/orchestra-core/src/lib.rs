//! Data model for session-oriented service orchestration.
//!
//! This crate provides the fundamental building blocks:
//! - `State` / `VariablePath` - Session state tree and addressing
//! - `Message` / `SessionMessage` - Inbound messages and their channels
//! - `Fault` - Domain-level faults
//! - `CorrelationSet` - Routing keys over session state
//! - `RuntimeConfig` - Execution mode and timing
//! - Channel and monitor traits, plus the `EventStore` monitor

pub mod config;
pub mod correlation;
pub mod event_store;
pub mod fault;
pub mod message;
pub mod state;
pub mod traits;

pub use config::{CorrelationAlgorithm, ExecutionMode, RuntimeConfig};
pub use correlation::{CorrelationPair, CorrelationSet};
pub use event_store::{EventStore, SessionEvent};
pub use fault::Fault;
pub use message::{Message, Outcome, Response, SessionMessage};
pub use state::{State, VariablePath};
pub use traits::{Monitor, ResponseChannel, SessionId, TracingMonitor};
