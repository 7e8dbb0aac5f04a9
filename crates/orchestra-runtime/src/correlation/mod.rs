//! Correlation engines: matching inbound messages to live sessions.

pub mod hash;
pub mod simple;

use std::sync::Arc;

use orchestra_core::{CorrelationAlgorithm, SessionMessage};

pub use hash::HashCorrelationEngine;
pub use simple::SimpleCorrelationEngine;

use crate::{registry::SessionStarter, session::Session};

/// Routes messages to live sessions and tracks their lifetime.
pub trait CorrelationEngine: Send + Sync {
    /// Track a session that receives every uncorrelated message: the
    /// initializer, or the main session of single execution mode.
    fn on_single_execution_session_start(&self, session: &Arc<Session>);

    /// Track a spawned session. Its correlation values have already been
    /// initialised from `message`.
    fn on_session_start(&self, session: &Arc<Session>, starter: &SessionStarter, message: &SessionMessage);

    /// Stop tracking a finished session.
    fn on_session_executed(&self, session: &Arc<Session>);

    /// The session's correlation values changed.
    fn on_correlation_update(&self, _session: &Arc<Session>) {}

    /// Live session `message` correlates with, if any.
    fn route(&self, message: &SessionMessage) -> Option<Arc<Session>>;

    /// Every tracked session.
    fn sessions(&self) -> Vec<Arc<Session>>;
}

/// Create the engine for `algorithm`.
#[must_use]
pub fn create(algorithm: CorrelationAlgorithm) -> Box<dyn CorrelationEngine> {
    match algorithm {
        CorrelationAlgorithm::Simple => Box::new(SimpleCorrelationEngine::new()),
        CorrelationAlgorithm::Hash => Box::new(HashCorrelationEngine::new()),
    }
}

/// Copy the correlation values carried by the starter message into the
/// session state.
pub fn init_correlation_values(session: &Session, starter: &SessionStarter, message: &SessionMessage) {
    let Some(set_name) = starter.correlation_initializer() else {
        return;
    };
    let Some(set) = session.registry().correlation_set_named(set_name) else {
        return;
    };
    let Some(pairs) = set.pairs(message.operation()) else {
        return;
    };
    for pair in pairs {
        let Some(value) = pair.message_path.get(&message.message().payload) else {
            tracing::warn!(
                session = %session.id(),
                path = %pair.message_path,
                "Starter message lacks correlation value"
            );
            continue;
        };
        if let Err(e) = session.set(&pair.session_path, value.clone()) {
            tracing::warn!(session = %session.id(), error = %e, "Cannot store correlation value");
        }
    }
}

/// Live sessions in start order, shared by both engines.
#[derive(Default)]
pub(crate) struct SessionTable {
    catch_all: Vec<Arc<Session>>,
    spawned: Vec<Arc<Session>>,
}

impl SessionTable {
    pub(crate) fn add_catch_all(&mut self, session: &Arc<Session>) {
        self.catch_all.push(Arc::clone(session));
    }

    pub(crate) fn add_spawned(&mut self, session: &Arc<Session>) {
        self.spawned.push(Arc::clone(session));
    }

    pub(crate) fn remove(&mut self, session: &Arc<Session>) {
        self.catch_all.retain(|s| !Arc::ptr_eq(s, session));
        self.spawned.retain(|s| !Arc::ptr_eq(s, session));
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.catch_all.iter().chain(&self.spawned)
    }

    /// Session for an operation outside every correlation set: the
    /// catch-all session, else the oldest session waiting on it.
    pub(crate) fn route_uncorrelated(&self, operation: &str) -> Option<Arc<Session>> {
        self.catch_all
            .first()
            .or_else(|| {
                self.spawned
                    .iter()
                    .find(|session| session.pending_waiters(operation) > 0)
            })
            .cloned()
    }

    pub(crate) fn to_vec(&self) -> Vec<Arc<Session>> {
        self.iter().cloned().collect()
    }
}
