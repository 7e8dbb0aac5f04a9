//! Session state tree and variable paths.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Error raised when a path cannot be written.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Empty variable path")]
    Empty,
    #[error("Cannot descend into non-object value at `{0}`")]
    NotAnObject(String),
}

/// Location inside a state tree, as an ordered list of object keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariablePath(Vec<String>);

impl VariablePath {
    /// Create a path from its segments.
    #[must_use]
    pub fn new<I>(segments: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a dotted path such as `order.id`.
    #[must_use]
    pub fn parse(dotted: &str) -> Self {
        Self::new(dotted.split('.').filter(|s| !s.is_empty()))
    }

    /// Path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Resolve this path against `root`. The empty path resolves to the root.
    #[must_use]
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.0
            .iter()
            .try_fold(root, |node, key| node.as_object()?.get(key))
    }

    /// Write `value` at this path, creating intermediate objects.
    ///
    /// `Null` nodes along the way are replaced by empty objects.
    ///
    /// # Errors
    /// Returns error if the path is empty or crosses a non-object value.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), PathError> {
        let (last, parents) = self.0.split_last().ok_or(PathError::Empty)?;
        let mut node = root;
        for (depth, key) in parents.iter().enumerate() {
            node = object_mut(node, &self.0[..depth])?
                .entry(key.clone())
                .or_insert(Value::Null);
        }
        object_mut(node, parents)?.insert(last.clone(), value);
        Ok(())
    }
}

fn object_mut<'a>(node: &'a mut Value, at: &[String]) -> Result<&'a mut Map<String, Value>, PathError> {
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut()
        .ok_or_else(|| PathError::NotAnObject(at.join(".")))
}

impl fmt::Display for VariablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for VariablePath {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}

/// Private state tree of one execution.
///
/// Cloning a `State` deep-copies the whole tree; spawned sessions never
/// share nodes with the template they were cloned from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    root: Value,
}

impl State {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    /// Create a state from an existing tree.
    #[must_use]
    pub const fn from_value(root: Value) -> Self {
        Self { root }
    }

    #[must_use]
    pub const fn root(&self) -> &Value {
        &self.root
    }

    /// Read the value at `path`.
    #[must_use]
    pub fn get(&self, path: &VariablePath) -> Option<&Value> {
        path.get(&self.root)
    }

    /// Write `value` at `path`.
    ///
    /// # Errors
    /// Returns error if the path cannot be created.
    pub fn set(&mut self, path: &VariablePath, value: Value) -> Result<(), PathError> {
        path.set(&mut self.root, value)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut state = State::new();
        state.set(&"order.customer.id".into(), json!("c-7")).unwrap();
        assert_eq!(state.root(), &json!({"order": {"customer": {"id": "c-7"}}}));
        assert_eq!(state.get(&"order.customer.id".into()), Some(&json!("c-7")));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut state = State::from_value(json!({"order": 5}));
        let err = state.set(&"order.id".into(), json!(1)).unwrap_err();
        assert_eq!(err, PathError::NotAnObject("order".to_string()));
        assert_eq!(
            state.set(&VariablePath::new(Vec::<String>::new()), json!(1)),
            Err(PathError::Empty)
        );
    }

    #[test]
    fn test_clone_is_deep() {
        let mut template = State::new();
        template.set(&"counter".into(), json!(1)).unwrap();
        let mut copy = template.clone();
        copy.set(&"counter".into(), json!(2)).unwrap();
        assert_eq!(template.get(&"counter".into()), Some(&json!(1)));
        assert_eq!(copy.get(&"counter".into()), Some(&json!(2)));
    }
}
