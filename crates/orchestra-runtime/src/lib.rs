//! Session lifecycle and message correlation.
//!
//! Provides:
//! - `Router` - Route inbound messages to sessions under an execution mode
//! - `Session` - Message queues, waiters and the session body
//! - `ExecutionContext` - Scope stack, fault handlers and compensations
//! - Correlation engines (simple, hash)

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod context;
pub mod correlation;
mod housekeeping;
pub mod process;
pub mod registry;
pub mod router;
pub mod session;
pub mod waiter;

pub use context::{ExecutionContext, Scope};
pub use correlation::CorrelationEngine;
pub use process::{InputOperation, Process, process_fn};
pub use registry::{BuildError, Registry, SessionStarter};
pub use router::{Router, RouterBuilder, RouterError};
pub use session::{Session, SessionKind, SessionListener};
pub use waiter::{MessageFuture, WaitError};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
