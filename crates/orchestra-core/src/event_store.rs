//! Broadcast + history store for session lifecycle events.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{Fault, traits::{Monitor, SessionId}};

/// Default number of events kept in history.
const HISTORY_EVENTS: usize = 10_000;

/// Lifecycle event recorded by [`EventStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { operation: String, session: SessionId },
    Ended { operation: String, session: SessionId },
    UnhandledFault { session: SessionId, fault: Fault },
}

/// Monitor keeping a bounded history and a live feed.
///
/// Late subscribers receive the history first, then live events.
pub struct EventStore {
    history: RwLock<VecDeque<SessionEvent>>,
    capacity: usize,
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create a store with the default history size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_EVENTS)
    }

    /// Create a store keeping at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity: capacity.max(1),
            sender,
        }
    }

    /// Record an event.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.sender.send(event.clone()); // live listeners

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

impl Monitor for EventStore {
    fn session_started(&self, operation: &str, session: SessionId) {
        self.push(SessionEvent::Started {
            operation: operation.to_string(),
            session,
        });
    }

    fn session_ended(&self, operation: &str, session: SessionId) {
        self.push(SessionEvent::Ended {
            operation: operation.to_string(),
            session,
        });
    }

    fn unhandled_fault(&self, session: SessionId, fault: &Fault) {
        tracing::info!(%session, fault = %fault.name, "Thrown unhandled fault");
        self.push(SessionEvent::UnhandledFault {
            session,
            fault: fault.clone(),
        });
    }
}
