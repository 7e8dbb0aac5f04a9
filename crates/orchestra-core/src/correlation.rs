//! Correlation sets: which session fields form a routing key, and where
//! each operation carries them.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{State, VariablePath};

/// One (session path, message path) pair of an operation alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationPair {
    /// Correlation variable inside the session state.
    pub session_path: VariablePath,
    /// Where the operation's message carries the value.
    pub message_path: VariablePath,
}

impl CorrelationPair {
    #[must_use]
    pub fn new(session_path: impl Into<VariablePath>, message_path: impl Into<VariablePath>) -> Self {
        Self {
            session_path: session_path.into(),
            message_path: message_path.into(),
        }
    }
}

/// Immutable description of a correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationSet {
    name: String,
    variables: Vec<VariablePath>,
    aliases: HashMap<String, Vec<CorrelationPair>>,
}

impl CorrelationSet {
    /// Start describing a correlation set.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> CorrelationSetBuilder {
        CorrelationSetBuilder {
            name: name.into(),
            variables: Vec::new(),
            aliases: HashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Correlation variable paths, in declaration order.
    #[must_use]
    pub fn variables(&self) -> &[VariablePath] {
        &self.variables
    }

    /// Operations that participate in this set.
    #[must_use]
    pub fn correlating_operations(&self) -> BTreeSet<&str> {
        self.aliases.keys().map(String::as_str).collect()
    }

    /// Pairs declared for `operation`.
    #[must_use]
    pub fn pairs(&self, operation: &str) -> Option<&[CorrelationPair]> {
        self.aliases.get(operation).map(Vec::as_slice)
    }

    /// Key carried by a message for `operation`, ordered like
    /// [`variables`](Self::variables).
    ///
    /// Returns `None` if the operation is not part of the set or the
    /// message lacks one of the values.
    #[must_use]
    pub fn message_key(&self, operation: &str, payload: &Value) -> Option<Vec<Value>> {
        let pairs = self.pairs(operation)?;
        self.variables
            .iter()
            .map(|var| {
                let pair = pairs.iter().find(|p| &p.session_path == var)?;
                pair.message_path.get(payload).cloned()
            })
            .collect()
    }

    /// Key stored in a session state, or `None` if not fully assigned.
    #[must_use]
    pub fn session_key(&self, state: &State) -> Option<Vec<Value>> {
        self.variables
            .iter()
            .map(|var| state.get(var).cloned())
            .collect()
    }

    /// Exact-value comparison of a message against a session state.
    #[must_use]
    pub fn matches(&self, operation: &str, payload: &Value, state: &State) -> bool {
        match (self.message_key(operation, payload), self.session_key(state)) {
            (Some(message), Some(session)) => message == session,
            _ => false,
        }
    }
}

/// Builder for [`CorrelationSet`].
#[derive(Debug)]
pub struct CorrelationSetBuilder {
    name: String,
    variables: Vec<VariablePath>,
    aliases: HashMap<String, Vec<CorrelationPair>>,
}

impl CorrelationSetBuilder {
    /// Declare a correlation variable.
    #[must_use]
    pub fn variable(mut self, path: impl Into<VariablePath>) -> Self {
        let path = path.into();
        if !self.variables.contains(&path) {
            self.variables.push(path);
        }
        self
    }

    /// Map `operation`'s `message_path` onto the session variable
    /// `session_path`.
    #[must_use]
    pub fn alias(
        mut self,
        operation: impl Into<String>,
        session_path: impl Into<VariablePath>,
        message_path: impl Into<VariablePath>,
    ) -> Self {
        self.aliases
            .entry(operation.into())
            .or_default()
            .push(CorrelationPair::new(session_path, message_path));
        self
    }

    #[must_use]
    pub fn build(self) -> CorrelationSet {
        CorrelationSet {
            name: self.name,
            variables: self.variables,
            aliases: self.aliases,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn order_set() -> CorrelationSet {
        CorrelationSet::builder("order")
            .variable("orderId")
            .alias("open", "orderId", "id")
            .alias("confirm", "orderId", "ref.id")
            .build()
    }

    #[test]
    fn test_correlating_operations() {
        let set = order_set();
        let ops: Vec<_> = set.correlating_operations().into_iter().collect();
        assert_eq!(ops, vec!["confirm", "open"]);
    }

    #[test]
    fn test_message_matches_session_key() {
        let set = order_set();
        let state = State::from_value(json!({"orderId": "X1"}));

        assert!(set.matches("confirm", &json!({"ref": {"id": "X1"}}), &state));
        assert!(!set.matches("confirm", &json!({"ref": {"id": "X2"}}), &state));
        assert!(!set.matches("confirm", &json!({}), &state));
        assert!(!set.matches("unknown", &json!({"id": "X1"}), &state));
    }

    #[test]
    fn test_unassigned_session_never_matches() {
        let set = order_set();
        assert!(!set.matches("open", &json!({"id": "X1"}), &State::new()));
    }

    #[test]
    fn test_multi_variable_key_order() {
        let set = CorrelationSet::builder("pair")
            .variable("a")
            .variable("b")
            .alias("op", "b", "y")
            .alias("op", "a", "x")
            .build();
        let key = set.message_key("op", &json!({"x": 1, "y": 2})).unwrap();
        assert_eq!(key, vec![json!(1), json!(2)]);
    }
}
