//! Execution contexts: scope stacks, fault handlers, compensations and
//! cooperative cancellation.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, Weak},
};

use orchestra_core::{
    Fault,
    fault::{DEFAULT_HANDLER_NAME, IO_EXCEPTION_FAULT_NAME, TYPE_MISMATCH_FAULT_NAME},
};
use tokio::sync::watch;

use crate::{
    lock,
    process::{LogFaultValue, Process},
    waiter::Cancellable,
};

/// Name of the root scope every top-level context starts with.
pub const ROOT_SCOPE_NAME: &str = "main";

/// A fault handling scope.
///
/// Holds fault handlers by fault name and compensation handlers by scope
/// name. A scope's own compensation is stored under its own name.
#[derive(Clone)]
pub struct Scope {
    name: String,
    fault_handlers: HashMap<String, Arc<dyn Process>>,
    compensations: HashMap<String, Arc<dyn Process>>,
}

impl Scope {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fault_handlers: HashMap::new(),
            compensations: HashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the compensation handler of this scope.
    pub fn install_compensation(&mut self, process: Arc<dyn Process>) {
        self.compensations.insert(self.name.clone(), process);
    }

    pub fn install_fault_handler(&mut self, fault_name: impl Into<String>, process: Arc<dyn Process>) {
        self.fault_handlers.insert(fault_name.into(), process);
    }

    /// Look up the handler for `fault_name`.
    ///
    /// With `erase`, a missing handler falls back to the default handler,
    /// and finding any handler uninstalls every handler of this scope.
    pub fn fault_handler(&mut self, fault_name: &str, erase: bool) -> Option<Arc<dyn Process>> {
        let handler = self.fault_handlers.get(fault_name).cloned();
        if !erase {
            return handler;
        }
        let handler = handler.or_else(|| self.fault_handlers.get(DEFAULT_HANDLER_NAME).cloned());
        if handler.is_some() {
            self.fault_handlers.clear();
        }
        handler
    }

    /// Compensation handler of this scope. Stays installed.
    #[must_use]
    pub fn self_compensation(&self) -> Option<Arc<dyn Process>> {
        self.compensations.get(&self.name).cloned()
    }

    /// Compensation handler of the child scope `scope_name`. Uninstalled
    /// by this call.
    pub fn take_compensation(&mut self, scope_name: &str) -> Option<Arc<dyn Process>> {
        self.compensations.remove(scope_name)
    }

    /// Copy every compensation handler of `other` into this scope.
    pub fn merge_compensations(&mut self, other: &Self) {
        self.compensations.extend(
            other
                .compensations
                .iter()
                .map(|(name, process)| (name.clone(), Arc::clone(process))),
        );
    }

    /// Names of the scopes this scope holds compensations for.
    #[must_use]
    pub fn compensation_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.compensations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<_> = self.fault_handlers.keys().collect();
        handlers.sort_unstable();
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("fault_handlers", &handlers)
            .field("compensations", &self.compensation_names())
            .finish()
    }
}

struct ContextInner {
    scopes: Vec<Scope>,
    to_cancel: VecDeque<Weak<dyn Cancellable>>,
    interruptible: bool,
    killer_fault: Option<Fault>,
}

/// A running unit of control.
///
/// When its own scope stack is empty, scope operations fall through to
/// the parent context.
pub struct ExecutionContext {
    parent: Option<Arc<ExecutionContext>>,
    inner: Mutex<ContextInner>,
    interrupt: watch::Sender<bool>,
}

impl ExecutionContext {
    fn with_parts(parent: Option<Arc<Self>>, scopes: Vec<Scope>) -> Arc<Self> {
        Arc::new(Self {
            parent,
            inner: Mutex::new(ContextInner {
                scopes,
                to_cancel: VecDeque::new(),
                interruptible: false,
                killer_fault: None,
            }),
            interrupt: watch::Sender::new(false),
        })
    }

    /// Top-level context with a root scope carrying the built-in handlers.
    #[must_use]
    pub fn root() -> Arc<Self> {
        let mut scope = Scope::new(ROOT_SCOPE_NAME);
        for fault in [TYPE_MISMATCH_FAULT_NAME, IO_EXCEPTION_FAULT_NAME] {
            scope.install_fault_handler(fault, Arc::new(LogFaultValue::new(ROOT_SCOPE_NAME, fault)));
        }
        Self::with_parts(None, vec![scope])
    }

    /// Top-level context starting from a copy of another scope stack.
    #[must_use]
    pub fn with_scopes(scopes: Vec<Scope>) -> Arc<Self> {
        Self::with_parts(None, scopes)
    }

    /// Child context with an empty scope stack, e.g. for a parallel branch.
    #[must_use]
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Self::with_parts(Some(Arc::clone(self)), Vec::new())
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    /// Copy of this context's own scope stack, outermost first.
    #[must_use]
    pub fn scope_snapshot(&self) -> Vec<Scope> {
        lock(&self.inner).scopes.clone()
    }

    /// Run `f` on the innermost scope, delegating to the parent when the
    /// local stack is empty. `None` if no context in the chain has a scope.
    fn with_top_scope<R>(&self, f: impl FnOnce(&mut Scope) -> R) -> Option<R> {
        let mut inner = lock(&self.inner);
        if let Some(top) = inner.scopes.last_mut() {
            return Some(f(top));
        }
        drop(inner);
        self.parent.as_ref()?.with_top_scope(f)
    }

    pub fn push_scope(&self, name: impl Into<String>) {
        lock(&self.inner).scopes.push(Scope::new(name));
    }

    /// Pop the innermost scope. With `merge`, its compensations move to
    /// the new innermost scope, or to the parent context if none is left.
    pub fn pop_scope(&self, merge: bool) {
        let mut inner = lock(&self.inner);
        let Some(popped) = inner.scopes.pop() else {
            return;
        };
        if !merge {
            return;
        }
        if let Some(top) = inner.scopes.last_mut() {
            top.merge_compensations(&popped);
            return;
        }
        drop(inner);
        if let Some(parent) = &self.parent {
            parent.merge_compensations(&popped);
        }
    }

    fn merge_compensations(&self, scope: &Scope) {
        if self.with_top_scope(|top| top.merge_compensations(scope)).is_none() {
            tracing::debug!(scope = scope.name(), "Dropping compensations with no enclosing scope");
        }
    }

    #[must_use]
    pub fn has_scope(&self) -> bool {
        !lock(&self.inner).scopes.is_empty()
    }

    /// Name of the innermost scope along the parent chain.
    #[must_use]
    pub fn current_scope_name(&self) -> Option<String> {
        self.with_top_scope(|top| top.name().to_string())
    }

    pub fn install_fault_handler(&self, fault_name: impl Into<String>, process: Arc<dyn Process>) {
        let fault_name = fault_name.into();
        if self
            .with_top_scope(|top| top.install_fault_handler(fault_name.clone(), process))
            .is_none()
        {
            tracing::warn!(fault = %fault_name, "No scope to install fault handler into");
        }
    }

    /// Install `process` as the compensation of the innermost scope.
    pub fn install_compensation(&self, process: Arc<dyn Process>) {
        if self.with_top_scope(|top| top.install_compensation(process)).is_none() {
            tracing::warn!("No scope to install compensation into");
        }
    }

    #[must_use]
    pub fn fault_handler(&self, fault_name: &str, erase: bool) -> Option<Arc<dyn Process>> {
        self.with_top_scope(|top| top.fault_handler(fault_name, erase))
            .flatten()
    }

    /// Compensation of the child scope `scope_name`, uninstalled on return.
    #[must_use]
    pub fn compensation(&self, scope_name: &str) -> Option<Arc<dyn Process>> {
        self.with_top_scope(|top| top.take_compensation(scope_name))
            .flatten()
    }

    /// Compensation of the innermost scope itself.
    #[must_use]
    pub fn self_compensation(&self) -> Option<Arc<dyn Process>> {
        self.with_top_scope(|top| top.self_compensation()).flatten()
    }

    /// Allow or forbid `kill` to interrupt the running body.
    pub fn set_interruptible(&self, interruptible: bool) {
        lock(&self.inner).interruptible = interruptible;
    }

    #[must_use]
    pub fn is_interruptible(&self) -> bool {
        lock(&self.inner).interruptible
    }

    /// Kill this context: record `fault`, cancel every live registered
    /// handle and, if interruptible, signal the running body.
    ///
    /// Returns the number of handles this call cancelled.
    pub fn kill(&self, fault: Fault) -> usize {
        let (pending, interruptible) = {
            let mut inner = lock(&self.inner);
            inner.killer_fault = Some(fault);
            (std::mem::take(&mut inner.to_cancel), inner.interruptible)
        };

        let cancelled = pending
            .into_iter()
            .filter_map(|handle| handle.upgrade())
            .filter(|handle| handle.cancel())
            .count();

        if interruptible {
            self.interrupt.send_replace(true);
        }
        tracing::debug!(cancelled, interruptible, "Execution context killed");
        cancelled
    }

    #[must_use]
    pub fn killer_fault(&self) -> Option<Fault> {
        lock(&self.inner).killer_fault.clone()
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        lock(&self.inner).killer_fault.is_some()
    }

    /// Return to normal execution after a kill.
    pub fn clear_kill(&self) {
        lock(&self.inner).killer_fault = None;
        self.interrupt.send_replace(false);
    }

    /// Register `handle` for cancellation on kill, cancelling it right away
    /// if this context is already killed.
    ///
    /// Only a weak reference is kept.
    pub fn cancel_if_killed(&self, handle: &Arc<dyn Cancellable>) {
        let mut inner = lock(&self.inner);
        while inner
            .to_cancel
            .front()
            .is_some_and(|front| front.upgrade().is_none_or(|h| h.is_done()))
        {
            inner.to_cancel.pop_front();
        }
        if inner.killer_fault.is_some() {
            drop(inner);
            handle.cancel();
            return;
        }
        inner.to_cancel.push_back(Arc::downgrade(handle));
    }

    /// Resolves once this context has been interrupted by `kill`.
    pub async fn interrupted(&self) {
        let mut rx = self.interrupt.subscribe();
        let _ = rx.wait_for(|interrupted| *interrupted).await;
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("ExecutionContext")
            .field("scopes", &inner.scopes)
            .field("killer_fault", &inner.killer_fault)
            .field("has_parent", &self.parent.is_some())
            .finish_non_exhaustive()
    }
}
