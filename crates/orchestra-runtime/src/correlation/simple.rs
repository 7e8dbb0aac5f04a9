//! Linear-scan correlation engine.

use std::sync::{Arc, Mutex};

use orchestra_core::SessionMessage;

use super::{CorrelationEngine, SessionTable, init_correlation_values};
use crate::{lock, registry::SessionStarter, session::Session};

/// Compares every live session's stored key with the message key.
///
/// Useful for small numbers of concurrent sessions. Correlation values
/// may change at any time without notifying the engine.
#[derive(Default)]
pub struct SimpleCorrelationEngine {
    sessions: Mutex<SessionTable>,
}

impl SimpleCorrelationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CorrelationEngine for SimpleCorrelationEngine {
    fn on_single_execution_session_start(&self, session: &Arc<Session>) {
        lock(&self.sessions).add_catch_all(session);
    }

    fn on_session_start(&self, session: &Arc<Session>, starter: &SessionStarter, message: &SessionMessage) {
        init_correlation_values(session, starter, message);
        lock(&self.sessions).add_spawned(session);
    }

    fn on_session_executed(&self, session: &Arc<Session>) {
        lock(&self.sessions).remove(session);
    }

    fn route(&self, message: &SessionMessage) -> Option<Arc<Session>> {
        let operation = message.operation();
        let sessions = lock(&self.sessions);
        let Some(first) = sessions.iter().next() else {
            return None;
        };
        let Some(set) = first.registry().correlation_set_for(operation) else {
            return sessions.route_uncorrelated(operation);
        };
        let payload = &message.message().payload;
        sessions
            .iter()
            .find(|session| session.with_state(|state| set.matches(operation, payload, state)))
            .cloned()
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use orchestra_core::{
        CorrelationSet, Message, Response, ResponseChannel, State, traits::ChannelError,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        process::{InputOperation, Nop},
        registry::Registry,
    };

    struct NullChannel;

    #[async_trait]
    impl ResponseChannel for NullChannel {
        async fn send(&self, _response: Response) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn message(op: &str, payload: serde_json::Value) -> SessionMessage {
        SessionMessage::new(Message::new(op, 1, payload), Arc::new(NullChannel))
    }

    fn setup() -> (Arc<Registry>, SessionStarter) {
        let set = CorrelationSet::builder("order")
            .variable("orderId")
            .alias("open", "orderId", "id")
            .alias("confirm", "orderId", "id")
            .build();
        let starter = SessionStarter::new(InputOperation::new("open"), Arc::new(Nop))
            .with_correlation_initializer("order");
        let registry = Registry::new(vec![starter.clone()], vec![set]).unwrap();
        (Arc::new(registry), starter)
    }

    #[test]
    fn test_routes_by_initialised_key() {
        let (registry, starter) = setup();
        let engine = SimpleCorrelationEngine::new();

        let a = Session::new(Arc::new(Nop), State::new(), Arc::clone(&registry));
        let b = Session::new(Arc::new(Nop), State::new(), Arc::clone(&registry));
        engine.on_session_start(&a, &starter, &message("open", json!({"id": "X1"})));
        engine.on_session_start(&b, &starter, &message("open", json!({"id": "X2"})));
        assert_eq!(a.get(&"orderId".into()), Some(json!("X1")));

        let routed = engine.route(&message("confirm", json!({"id": "X2"}))).unwrap();
        assert!(Arc::ptr_eq(&routed, &b));
        assert!(engine.route(&message("confirm", json!({"id": "X3"}))).is_none());

        engine.on_session_executed(&b);
        assert!(engine.route(&message("confirm", json!({"id": "X2"}))).is_none());
        assert_eq!(engine.sessions().len(), 1);
    }

    #[test]
    fn test_uncorrelated_prefers_catch_all() {
        let (registry, starter) = setup();
        let engine = SimpleCorrelationEngine::new();
        assert!(engine.route(&message("note", json!(null))).is_none());

        let spawned = Session::new(Arc::new(Nop), State::new(), Arc::clone(&registry));
        engine.on_session_start(&spawned, &starter, &message("open", json!({"id": "X1"})));
        assert!(engine.route(&message("note", json!(null))).is_none());

        let _waiting = spawned.request_message("note", spawned.context());
        let routed = engine.route(&message("note", json!(null))).unwrap();
        assert!(Arc::ptr_eq(&routed, &spawned));

        let main = Session::new(Arc::new(Nop), State::new(), registry);
        engine.on_single_execution_session_start(&main);
        let routed = engine.route(&message("note", json!(null))).unwrap();
        assert!(Arc::ptr_eq(&routed, &main));
    }
}
