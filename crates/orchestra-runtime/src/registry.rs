//! Build-time tables: session starters and correlation sets.
//!
//! Populated once before routing starts, then shared read-only.

use std::{collections::HashMap, fmt, sync::Arc};

use orchestra_core::CorrelationSet;
use thiserror::Error;

use crate::process::{InputOperation, Process};

/// Inconsistent program structure. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Operation `{0}` is claimed by more than one session starter")]
    DuplicateStarter(String),
    #[error("Correlation set `{0}` is declared twice")]
    DuplicateCorrelationSet(String),
    #[error("Correlation set `{0}` has no correlation variables")]
    EmptyCorrelationSet(String),
    #[error("Operation `{operation}` belongs to correlation sets `{first}` and `{second}`")]
    OperationInTwoSets {
        operation: String,
        first: String,
        second: String,
    },
    #[error("Operation `{operation}` in correlation set `{set}` does not map variable `{variable}`")]
    MissingAlias {
        set: String,
        operation: String,
        variable: String,
    },
    #[error("Operation `{operation}` in correlation set `{set}` maps unknown variable `{variable}`")]
    UnknownVariable {
        set: String,
        operation: String,
        variable: String,
    },
    #[error("Unknown correlation set `{0}`")]
    UnknownCorrelationSet(String),
    #[error("Correlation set `{set}` does not correlate starter operation `{operation}`")]
    InitializerMismatch { set: String, operation: String },
    #[error("Single execution mode requires a main process")]
    MissingMain,
}

/// How a new session begins: a guard operation and a body.
#[derive(Clone)]
pub struct SessionStarter {
    guard: InputOperation,
    body: Arc<dyn Process>,
    correlation_initializer: Option<String>,
}

impl SessionStarter {
    #[must_use]
    pub fn new(guard: InputOperation, body: Arc<dyn Process>) -> Self {
        Self {
            guard,
            body,
            correlation_initializer: None,
        }
    }

    /// Name the correlation set whose key this starter's guard assigns.
    #[must_use]
    pub fn with_correlation_initializer(mut self, set: impl Into<String>) -> Self {
        self.correlation_initializer = Some(set.into());
        self
    }

    #[must_use]
    pub const fn guard(&self) -> &InputOperation {
        &self.guard
    }

    #[must_use]
    pub const fn body(&self) -> &Arc<dyn Process> {
        &self.body
    }

    #[must_use]
    pub fn correlation_initializer(&self) -> Option<&str> {
        self.correlation_initializer.as_deref()
    }
}

impl fmt::Debug for SessionStarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStarter")
            .field("guard", &self.guard)
            .field("correlation_initializer", &self.correlation_initializer)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of starters and correlation sets.
#[derive(Debug, Default)]
pub struct Registry {
    starters: HashMap<String, SessionStarter>,
    correlation_sets: Vec<Arc<CorrelationSet>>,
    operation_sets: HashMap<String, usize>,
}

impl Registry {
    /// Validate and freeze the program structure.
    ///
    /// # Errors
    /// Returns error on any inconsistency between starters and sets.
    pub fn new(starters: Vec<SessionStarter>, correlation_sets: Vec<CorrelationSet>) -> Result<Self, BuildError> {
        let mut operation_sets: HashMap<String, usize> = HashMap::new();
        for (index, set) in correlation_sets.iter().enumerate() {
            if correlation_sets[..index].iter().any(|s| s.name() == set.name()) {
                return Err(BuildError::DuplicateCorrelationSet(set.name().to_string()));
            }
            if set.variables().is_empty() {
                return Err(BuildError::EmptyCorrelationSet(set.name().to_string()));
            }
            for operation in set.correlating_operations() {
                validate_alias(set, operation)?;
                if let Some(&first) = operation_sets.get(operation) {
                    return Err(BuildError::OperationInTwoSets {
                        operation: operation.to_string(),
                        first: correlation_sets[first].name().to_string(),
                        second: set.name().to_string(),
                    });
                }
                operation_sets.insert(operation.to_string(), index);
            }
        }

        let mut table: HashMap<String, SessionStarter> = HashMap::new();
        for starter in starters {
            let operation = starter.guard().id().to_string();
            if let Some(set_name) = starter.correlation_initializer() {
                let set = correlation_sets
                    .iter()
                    .find(|s| s.name() == set_name)
                    .ok_or_else(|| BuildError::UnknownCorrelationSet(set_name.to_string()))?;
                if set.pairs(&operation).is_none() {
                    return Err(BuildError::InitializerMismatch {
                        set: set_name.to_string(),
                        operation,
                    });
                }
            }
            if table.contains_key(&operation) {
                return Err(BuildError::DuplicateStarter(operation));
            }
            table.insert(operation, starter);
        }

        Ok(Self {
            starters: table,
            correlation_sets: correlation_sets.into_iter().map(Arc::new).collect(),
            operation_sets,
        })
    }

    /// Starter whose guard is `operation`.
    #[must_use]
    pub fn starter(&self, operation: &str) -> Option<&SessionStarter> {
        self.starters.get(operation)
    }

    #[must_use]
    pub fn correlation_sets(&self) -> &[Arc<CorrelationSet>] {
        &self.correlation_sets
    }

    /// Position of the correlation set `operation` belongs to.
    #[must_use]
    pub fn correlation_set_index(&self, operation: &str) -> Option<usize> {
        self.operation_sets.get(operation).copied()
    }

    /// Correlation set `operation` belongs to, if any.
    #[must_use]
    pub fn correlation_set_for(&self, operation: &str) -> Option<&Arc<CorrelationSet>> {
        self.correlation_set_index(operation)
            .map(|index| &self.correlation_sets[index])
    }

    #[must_use]
    pub fn correlation_set_named(&self, name: &str) -> Option<&Arc<CorrelationSet>> {
        self.correlation_sets.iter().find(|set| set.name() == name)
    }
}

fn validate_alias(set: &CorrelationSet, operation: &str) -> Result<(), BuildError> {
    let pairs = set.pairs(operation).unwrap_or_default();
    if let Some(pair) = pairs
        .iter()
        .find(|pair| !set.variables().contains(&pair.session_path))
    {
        return Err(BuildError::UnknownVariable {
            set: set.name().to_string(),
            operation: operation.to_string(),
            variable: pair.session_path.to_string(),
        });
    }
    if let Some(variable) = set
        .variables()
        .iter()
        .find(|var| !pairs.iter().any(|pair| &pair.session_path == *var))
    {
        return Err(BuildError::MissingAlias {
            set: set.name().to_string(),
            operation: operation.to_string(),
            variable: variable.to_string(),
        });
    }
    Ok(())
}
