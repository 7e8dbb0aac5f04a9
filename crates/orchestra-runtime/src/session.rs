//! Sessions: private state, per-correlation-set message queues and the
//! waiter protocol.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use orchestra_core::{
    Fault, RuntimeConfig, SessionId, SessionMessage, State, VariablePath, state::PathError,
};
use serde_json::Value;
use tokio::{sync::watch, time::Instant};

use crate::{
    context::ExecutionContext,
    lock,
    process::Process,
    registry::Registry,
    waiter::{Cancellable, MessageFuture, WaitError, Waiter},
};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Role of a session within the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Runs the init process before any other session.
    Initializer,
    /// The single session of single execution mode.
    Main,
    /// Spawned by a session starter.
    Spawned,
}

/// Receiver of session completion events.
///
/// Each session reports exactly one of the two events.
pub trait SessionListener: Send + Sync {
    /// The session finished normally or recovered from every fault.
    fn on_session_executed(&self, session: &Arc<Session>);

    /// The session terminated on a fault no handler caught.
    fn on_session_error(&self, session: &Arc<Session>, fault: &Fault);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueId {
    Correlated(usize),
    Uncorrelated,
}

#[derive(Default)]
struct Mailbox {
    queues: Vec<VecDeque<SessionMessage>>,
    uncorrelated: VecDeque<SessionMessage>,
    waiters: HashMap<String, VecDeque<Arc<Waiter>>>,
    sealed: bool,
}

impl Mailbox {
    fn queue(&mut self, id: QueueId) -> &mut VecDeque<SessionMessage> {
        match id {
            QueueId::Correlated(index) => &mut self.queues[index],
            QueueId::Uncorrelated => &mut self.uncorrelated,
        }
    }

    /// Next live waiter for `operation`. Settled waiters met on the way
    /// are dropped.
    fn take_waiter(&mut self, operation: &str) -> Option<Arc<Waiter>> {
        let waiters = self.waiters.get_mut(operation)?;
        let found = loop {
            match waiters.pop_front() {
                Some(waiter) if waiter.is_done() => {}
                other => break other,
            }
        };
        if waiters.is_empty() {
            self.waiters.remove(operation);
        }
        found
    }

    /// Remove `waiter` from every operation it was registered under.
    fn retract(&mut self, waiter: &Arc<Waiter>) {
        for operation in waiter.operations() {
            if let Some(waiters) = self.waiters.get_mut(operation) {
                waiters.retain(|w| !Arc::ptr_eq(w, waiter));
                if waiters.is_empty() {
                    self.waiters.remove(operation);
                }
            }
        }
    }

    /// Deliver `message` to a live waiter for its operation, handing the
    /// message back if there is none.
    fn deliver_to_waiter(&mut self, mut message: SessionMessage) -> Result<(), SessionMessage> {
        let operation = message.operation().to_string();
        while let Some(waiter) = self.take_waiter(&operation) {
            let delivered = waiter.deliver(message);
            self.retract(&waiter);
            match delivered {
                Ok(()) => return Ok(()),
                Err(returned) => message = returned,
            }
        }
        Err(message)
    }

    /// Hand queued messages to waiters while the queue head has one.
    fn deliver_pending(&mut self, queue: QueueId) {
        while let Some(message) = self.queue(queue).pop_front() {
            if let Err(message) = self.deliver_to_waiter(message) {
                self.queue(queue).push_front(message);
                break;
            }
        }
    }

    /// Drop settled waiters registered under `operation`.
    fn prune(&mut self, operation: &str) {
        if let Some(waiters) = self.waiters.get_mut(operation) {
            waiters.retain(|w| !w.is_done());
            if waiters.is_empty() {
                self.waiters.remove(operation);
            }
        }
    }

    /// Drop every settled waiter.
    fn prune_all(&mut self) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_done());
            !waiters.is_empty()
        });
    }

    fn live_waiters(&self, operation: &str) -> usize {
        self.waiters
            .get(operation)
            .map_or(0, |waiters| waiters.iter().filter(|w| !w.is_done()).count())
    }
}

/// One running instance of the orchestration program.
pub struct Session {
    id: SessionId,
    kind: SessionKind,
    process: Arc<dyn Process>,
    context: Arc<ExecutionContext>,
    registry: Arc<Registry>,
    state: Mutex<State>,
    mailbox: Mutex<Mailbox>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    starter_message: Option<SessionMessage>,
    response_timeout: Duration,
    started: AtomicBool,
    done: watch::Sender<bool>,
}

impl Session {
    fn build(
        kind: SessionKind,
        process: Arc<dyn Process>,
        state: State,
        context: Arc<ExecutionContext>,
        registry: Arc<Registry>,
        starter_message: Option<SessionMessage>,
        response_timeout: Duration,
    ) -> Arc<Self> {
        let mailbox = Mailbox {
            queues: vec![VecDeque::new(); registry.correlation_sets().len()],
            ..Mailbox::default()
        };
        Arc::new(Self {
            id: SessionId(ID_COUNTER.fetch_add(1, Ordering::Relaxed)),
            kind,
            process,
            context,
            registry,
            state: Mutex::new(state),
            mailbox: Mutex::new(mailbox),
            listeners: Mutex::new(Vec::new()),
            starter_message,
            response_timeout,
            started: AtomicBool::new(false),
            done: watch::Sender::new(false),
        })
    }

    /// Create a standalone session with a fresh root context and the
    /// default response timeout.
    #[must_use]
    pub fn new(process: Arc<dyn Process>, state: State, registry: Arc<Registry>) -> Arc<Self> {
        Self::build(
            SessionKind::Spawned,
            process,
            state,
            ExecutionContext::root(),
            registry,
            None,
            RuntimeConfig::default().response_timeout(),
        )
    }

    pub(crate) fn initializer(
        process: Arc<dyn Process>,
        state: State,
        registry: Arc<Registry>,
        response_timeout: Duration,
    ) -> Arc<Self> {
        Self::build(
            SessionKind::Initializer,
            process,
            state,
            ExecutionContext::root(),
            registry,
            None,
            response_timeout,
        )
    }

    /// Create a session from `template`: deep copy of its state, copy of its
    /// scope stack.
    pub(crate) fn spawn_from(
        template: &Self,
        kind: SessionKind,
        process: Arc<dyn Process>,
        starter_message: Option<SessionMessage>,
    ) -> Arc<Self> {
        Self::build(
            kind,
            process,
            template.state_snapshot(),
            ExecutionContext::with_scopes(template.context.scope_snapshot()),
            Arc::clone(&template.registry),
            starter_message,
            template.response_timeout,
        )
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> SessionKind {
        self.kind
    }

    #[must_use]
    pub fn is_initialising(&self) -> bool {
        self.kind == SessionKind::Initializer
    }

    /// Root execution context of this session.
    #[must_use]
    pub const fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Deadline applied by [`request_reply`](Self::request_reply).
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Message that caused this session to be spawned, if any.
    #[must_use]
    pub const fn starter_message(&self) -> Option<&SessionMessage> {
        self.starter_message.as_ref()
    }

    /// Run `f` with read access to the state.
    pub fn with_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&lock(&self.state))
    }

    /// Deep copy of the current state.
    #[must_use]
    pub fn state_snapshot(&self) -> State {
        lock(&self.state).clone()
    }

    /// Value at `path`, cloned.
    #[must_use]
    pub fn get(&self, path: &VariablePath) -> Option<Value> {
        lock(&self.state).get(path).cloned()
    }

    /// Write `value` at `path`.
    ///
    /// # Errors
    /// Returns error if the path crosses a non-object value.
    pub fn set(&self, path: &VariablePath, value: Value) -> Result<(), PathError> {
        lock(&self.state).set(path, value)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        lock(&self.listeners).push(listener);
    }

    fn queue_for(&self, operation: &str) -> QueueId {
        self.registry
            .correlation_set_index(operation)
            .map_or(QueueId::Uncorrelated, QueueId::Correlated)
    }

    /// Deliver an inbound message to this session. Never blocks.
    ///
    /// A waiter already registered for the operation receives the message
    /// directly when its queue is empty; otherwise the message joins the
    /// tail of its queue.
    pub fn push_message(&self, message: SessionMessage) {
        let mut mailbox = lock(&self.mailbox);
        Self::enqueue(&mut mailbox, self.queue_for(message.operation()), message);
    }

    /// Like [`push_message`](Self::push_message), but refuses the message
    /// once the session has finished.
    pub(crate) fn offer_message(&self, message: SessionMessage) -> Result<(), SessionMessage> {
        let mut mailbox = lock(&self.mailbox);
        if mailbox.sealed {
            return Err(message);
        }
        Self::enqueue(&mut mailbox, self.queue_for(message.operation()), message);
        Ok(())
    }

    fn enqueue(mailbox: &mut Mailbox, queue: QueueId, message: SessionMessage) {
        let message = if mailbox.queue(queue).is_empty() {
            match mailbox.deliver_to_waiter(message) {
                Ok(()) => return,
                Err(message) => message,
            }
        } else {
            message
        };
        tracing::debug!(operation = message.operation(), "Queued message");
        mailbox.queue(queue).push_back(message);
    }

    /// Request the next message for `operation`.
    pub fn request_message(&self, operation: &str, ctx: &ExecutionContext) -> MessageFuture {
        self.request(&[operation], ctx, None)
    }

    /// Request the next message for whichever of `operations` arrives first.
    pub fn request_any(&self, operations: &[&str], ctx: &ExecutionContext) -> MessageFuture {
        self.request(operations, ctx, None)
    }

    /// Request the next message for `operation`, failing with a `Timeout`
    /// fault once `timeout` has elapsed and the sweeper runs.
    pub fn request_message_timeout(
        &self,
        operation: &str,
        ctx: &ExecutionContext,
        timeout: Duration,
    ) -> MessageFuture {
        self.request(&[operation], ctx, Some(Instant::now() + timeout))
    }

    /// Request the reply to an outbound solicit on `operation`, timed out
    /// after the configured response timeout.
    pub fn request_reply(&self, operation: &str, ctx: &ExecutionContext) -> MessageFuture {
        self.request_message_timeout(operation, ctx, self.response_timeout)
    }

    fn request(&self, operations: &[&str], ctx: &ExecutionContext, deadline: Option<Instant>) -> MessageFuture {
        let (waiter, future) = Waiter::new(operations, deadline);
        let handle: Arc<dyn Cancellable> = Arc::<Waiter>::clone(&waiter);
        ctx.cancel_if_killed(&handle);
        if waiter.is_done() {
            return future;
        }

        let mut mailbox = lock(&self.mailbox);
        for operation in operations {
            let queue = self.queue_for(operation);
            if mailbox
                .queue(queue)
                .front()
                .is_some_and(|head| head.operation() == *operation)
            {
                let Some(message) = mailbox.queue(queue).pop_front() else {
                    break;
                };
                if let Err(message) = waiter.deliver(message) {
                    mailbox.queue(queue).push_front(message);
                    return future;
                }
                mailbox.deliver_pending(queue);
                return future;
            }
        }

        for operation in operations {
            mailbox.prune(operation);
            mailbox
                .waiters
                .entry((*operation).to_string())
                .or_default()
                .push_back(Arc::clone(&waiter));
        }
        future
    }

    /// Number of live waiters registered for `operation`.
    #[must_use]
    pub fn pending_waiters(&self, operation: &str) -> usize {
        lock(&self.mailbox).live_waiters(operation)
    }

    #[cfg(test)]
    fn registered_waiters(&self) -> usize {
        lock(&self.mailbox).waiters.values().map(VecDeque::len).sum()
    }

    /// Number of queued messages for `operation`'s queue.
    #[must_use]
    pub fn queued_messages(&self, operation: &str) -> usize {
        let queue = self.queue_for(operation);
        lock(&self.mailbox).queue(queue).len()
    }

    /// Fail every waiter whose deadline is at or before `now` with a
    /// `Timeout` fault. Returns the number of expired waiters.
    ///
    /// Cancelled and abandoned waiters are dropped from the table too.
    pub fn sweep_expired_waiters(&self, now: Instant) -> usize {
        let mut mailbox = lock(&self.mailbox);
        mailbox.prune_all();
        let mut expired: Vec<Arc<Waiter>> = Vec::new();
        for waiters in mailbox.waiters.values() {
            for waiter in waiters {
                if waiter.is_expired(now) && !expired.iter().any(|w| Arc::ptr_eq(w, waiter)) {
                    expired.push(Arc::clone(waiter));
                }
            }
        }
        let mut count = 0;
        for waiter in &expired {
            mailbox.retract(waiter);
            let operation = waiter.operations().join("|");
            if waiter.fail(WaitError::Fault(Fault::timeout(&operation))) {
                count += 1;
            }
        }
        count
    }

    fn seal(&self) {
        lock(&self.mailbox).sealed = true;
    }

    /// Drain every queued message, correlated queues first.
    pub(crate) fn take_unconsumed(&self) -> Vec<SessionMessage> {
        let mut mailbox = lock(&self.mailbox);
        let mut messages: Vec<SessionMessage> = Vec::new();
        for queue in &mut mailbox.queues {
            messages.extend(queue.drain(..));
        }
        messages.extend(mailbox.uncorrelated.drain(..));
        messages
    }

    /// Spawn the session body on the runtime. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(session = %self.id, kind = ?self.kind, "Starting session");
        tokio::spawn(Arc::clone(self).run_process());
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until the body has finished and listeners have been notified.
    pub async fn join(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn run_process(self: Arc<Self>) {
        // Interruption ends the body like a normal return.
        let outcome = tokio::select! {
            biased;
            result = self.process.run(&self, &self.context) => result,
            () = self.context.interrupted() => Ok(()),
        };
        if self.context.is_killed() {
            tracing::debug!(session = %self.id, "Session ended after kill");
        }
        let outcome = match outcome {
            Ok(()) => Ok(()),
            Err(fault) => self.handle_fault(fault).await,
        };

        self.seal();
        let listeners = lock(&self.listeners).clone();
        match &outcome {
            Ok(()) => listeners.iter().for_each(|l| l.on_session_executed(&self)),
            Err(fault) => {
                tracing::debug!(session = %self.id, fault = %fault.name, "Session terminated by fault");
                listeners.iter().for_each(|l| l.on_session_error(&self, fault));
            }
        }
        self.done.send_replace(true);
    }

    /// Unwind the scope stack looking for a handler for `fault` and run it.
    /// Returns the fault that escaped, if any.
    async fn handle_fault(self: &Arc<Self>, fault: Fault) -> Result<(), Fault> {
        let ctx = &self.context;
        ctx.clear_kill();
        let handler = loop {
            match ctx.fault_handler(&fault.name, true) {
                Some(handler) => break Some(handler),
                None if ctx.has_scope() => ctx.pop_scope(true),
                None => break None,
            }
        };
        let Some(handler) = handler else {
            return Err(fault);
        };

        if let Some(scope) = ctx.current_scope_name() {
            let path = VariablePath::new([scope, fault.name.clone()]);
            if let Err(e) = self.set(&path, fault.value.clone()) {
                tracing::debug!(error = %e, "Could not store fault value");
            }
        }
        handler.run(self, ctx).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("started", &self.is_started())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}
