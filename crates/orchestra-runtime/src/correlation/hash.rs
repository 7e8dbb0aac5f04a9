//! Hash-indexed correlation engine.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use orchestra_core::{SessionId, SessionMessage};
use serde_json::Value;

use super::{CorrelationEngine, SessionTable, init_correlation_values};
use crate::{lock, registry::SessionStarter, session::Session};

/// Index key: correlation set position plus canonical key encoding.
type IndexKey = (usize, String);

#[derive(Default)]
struct Inner {
    table: SessionTable,
    index: HashMap<IndexKey, Arc<Session>>,
    keys: HashMap<SessionId, Vec<IndexKey>>,
}

impl Inner {
    fn unindex(&mut self, session: &Arc<Session>) {
        for key in self.keys.remove(&session.id()).unwrap_or_default() {
            if self.index.get(&key).is_some_and(|s| Arc::ptr_eq(s, session)) {
                self.index.remove(&key);
            }
        }
    }

    fn reindex(&mut self, session: &Arc<Session>) {
        self.unindex(session);
        let keys: Vec<IndexKey> = session
            .registry()
            .correlation_sets()
            .iter()
            .enumerate()
            .filter_map(|(position, set)| {
                let key = session.with_state(|state| set.session_key(state))?;
                Some((position, encode(&key)?))
            })
            .collect();
        for key in &keys {
            self.index.insert(key.clone(), Arc::clone(session));
        }
        self.keys.insert(session.id(), keys);
    }
}

/// Serialized form of a key. `serde_json` maps are ordered, so equal values
/// encode identically.
fn encode(key: &[Value]) -> Option<String> {
    serde_json::to_string(key).ok()
}

/// Looks sessions up by correlation key in constant time.
///
/// Sessions are indexed when spawned and whenever
/// [`on_correlation_update`](CorrelationEngine::on_correlation_update)
/// is called. If two sessions share a key, the latest indexed wins.
#[derive(Default)]
pub struct HashCorrelationEngine {
    inner: Mutex<Inner>,
}

impl HashCorrelationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CorrelationEngine for HashCorrelationEngine {
    fn on_single_execution_session_start(&self, session: &Arc<Session>) {
        let mut inner = lock(&self.inner);
        inner.table.add_catch_all(session);
        inner.reindex(session);
    }

    fn on_session_start(&self, session: &Arc<Session>, starter: &SessionStarter, message: &SessionMessage) {
        init_correlation_values(session, starter, message);
        let mut inner = lock(&self.inner);
        inner.table.add_spawned(session);
        inner.reindex(session);
    }

    fn on_session_executed(&self, session: &Arc<Session>) {
        let mut inner = lock(&self.inner);
        inner.table.remove(session);
        inner.unindex(session);
    }

    fn on_correlation_update(&self, session: &Arc<Session>) {
        let mut inner = lock(&self.inner);
        if inner.table.iter().any(|s| Arc::ptr_eq(s, session)) {
            inner.reindex(session);
        }
    }

    fn route(&self, message: &SessionMessage) -> Option<Arc<Session>> {
        let operation = message.operation();
        let inner = lock(&self.inner);
        let registry = Arc::clone(inner.table.iter().next()?.registry());
        let Some(position) = registry.correlation_set_index(operation) else {
            return inner.table.route_uncorrelated(operation);
        };
        let set = &registry.correlation_sets()[position];
        let key = set.message_key(operation, &message.message().payload)?;
        inner.index.get(&(position, encode(&key)?)).cloned()
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.inner).table.to_vec()
    }
}
