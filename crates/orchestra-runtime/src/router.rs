//! Router: routes inbound messages to sessions and schedules new ones
//! under the configured execution mode.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use orchestra_core::{
    CorrelationSet, ExecutionMode, Fault, Message, Monitor, ResponseChannel, RuntimeConfig,
    SessionMessage, State, TracingMonitor,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    correlation::{self, CorrelationEngine},
    housekeeping::spawn_sweeper,
    lock,
    process::{Nop, Process, Sequence},
    registry::{BuildError, Registry, SessionStarter},
    session::{Session, SessionKind, SessionListener},
};

/// Routing error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("Message for operation `{operation}` matches no session and starts none")]
    Correlation { operation: String },
    #[error("Router is exiting")]
    Exiting,
    #[error("Router has not been started")]
    NotStarted,
}

/// Collects the program structure and validates it into a [`Router`].
pub struct RouterBuilder {
    config: RuntimeConfig,
    starters: Vec<SessionStarter>,
    correlation_sets: Vec<CorrelationSet>,
    init: Option<Arc<dyn Process>>,
    main: Option<Arc<dyn Process>>,
    monitor: Arc<dyn Monitor>,
    initial_state: State,
}

impl RouterBuilder {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            starters: Vec::new(),
            correlation_sets: Vec::new(),
            init: None,
            main: None,
            monitor: Arc::new(TracingMonitor),
            initial_state: State::new(),
        }
    }

    /// Register a session starter.
    #[must_use]
    pub fn register(mut self, starter: SessionStarter) -> Self {
        self.starters.push(starter);
        self
    }

    #[must_use]
    pub fn add_correlation_set(mut self, set: CorrelationSet) -> Self {
        self.correlation_sets.push(set);
        self
    }

    /// Process run by the initializer before any session starts.
    #[must_use]
    pub fn init(mut self, process: Arc<dyn Process>) -> Self {
        self.init = Some(process);
        self
    }

    /// Body of the main session. Required in single execution mode.
    #[must_use]
    pub fn main(mut self, process: Arc<dyn Process>) -> Self {
        self.main = Some(process);
        self
    }

    #[must_use]
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// State the initializer starts from.
    #[must_use]
    pub fn initial_state(mut self, state: State) -> Self {
        self.initial_state = state;
        self
    }

    /// Validate the program structure.
    ///
    /// # Errors
    /// Returns error if starters and correlation sets are inconsistent, or
    /// if single execution mode has no main process.
    pub fn build(self) -> Result<Router, BuildError> {
        if self.config.execution_mode == ExecutionMode::Single && self.main.is_none() {
            return Err(BuildError::MissingMain);
        }
        let registry = Arc::new(Registry::new(self.starters, self.correlation_sets)?);
        let init = Session::initializer(
            self.init.unwrap_or_else(|| Arc::new(Nop)),
            self.initial_state,
            Arc::clone(&registry),
            self.config.response_timeout(),
        );
        let engine = correlation::create(self.config.correlation_algorithm);

        Ok(Router {
            inner: Arc::new(Inner {
                config: self.config,
                registry,
                engine,
                monitor: self.monitor,
                init,
                main_process: self.main,
                main_session: Mutex::new(None),
                waiting: Mutex::new(VecDeque::new()),
                exited: watch::Sender::new(false),
                housekeeping: Mutex::new(None),
            }),
        })
    }
}

struct Inner {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    engine: Box<dyn CorrelationEngine>,
    monitor: Arc<dyn Monitor>,
    init: Arc<Session>,
    main_process: Option<Arc<dyn Process>>,
    main_session: Mutex<Option<Arc<Session>>>,
    /// Sequential mode: spawned sessions in start order. The head runs.
    waiting: Mutex<VecDeque<Arc<Session>>>,
    exited: watch::Sender<bool>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn exit(&self) {
        if !self.exited.send_replace(true) {
            tracing::info!("Router exiting");
        }
    }

    fn launch(&self, session: &Arc<Session>) {
        let operation = session.starter_message().map_or("", SessionMessage::operation);
        self.monitor.session_started(operation, session.id());
        session.start();
    }

    /// Sequential mode: drop `finished` from the waiting queue and start the
    /// new head.
    fn advance_queue(&self, finished: &Arc<Session>) {
        let next = {
            let mut waiting = lock(&self.waiting);
            let was_head = waiting.front().is_some_and(|s| Arc::ptr_eq(s, finished));
            waiting.retain(|s| !Arc::ptr_eq(s, finished));
            if was_head { waiting.front().cloned() } else { None }
        };
        if let Some(next) = next {
            self.launch(&next);
        }
    }
}

/// Routes inbound messages to sessions. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// The initializer session.
    #[must_use]
    pub fn init_session(&self) -> &Arc<Session> {
        &self.inner.init
    }

    /// The main session, once single mode has created it.
    #[must_use]
    pub fn main_session(&self) -> Option<Arc<Session>> {
        lock(&self.inner.main_session).clone()
    }

    /// Every live session the correlation engine tracks.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.engine.sessions()
    }

    /// Sequential mode: number of sessions queued or running.
    #[must_use]
    pub fn waiting_sessions(&self) -> usize {
        lock(&self.inner.waiting).len()
    }

    /// Start the initializer and the housekeeping task. Must be called
    /// from within a tokio runtime. Later calls do nothing.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.init.is_started() {
            return;
        }
        inner.engine.on_single_execution_session_start(&inner.init);
        inner.init.add_listener(Arc::new(InitListener {
            router: Arc::downgrade(inner),
        }));

        let weak = Arc::downgrade(inner);
        let handle = spawn_sweeper(
            inner.config.housekeeping_interval(),
            inner.exited.subscribe(),
            move || weak.upgrade().map(|inner| inner.engine.sessions()),
        );
        *lock(&inner.housekeeping) = Some(handle);

        tracing::info!(mode = ?inner.config.execution_mode, "Router started");
        inner.init.start();
    }

    /// Route an inbound message.
    ///
    /// The message goes to the live session it correlates with, else starts
    /// a new session. If neither applies, a `CorrelationError` fault is
    /// answered on `channel`.
    ///
    /// # Errors
    /// Returns error if the message cannot be routed, or the router is
    /// exiting or not started.
    pub async fn on_message_receive(
        &self,
        message: Message,
        channel: Arc<dyn ResponseChannel>,
    ) -> Result<(), RouterError> {
        route(&self.inner, SessionMessage::new(message, channel)).await
    }

    /// Start a new session for a message that matched no live session.
    ///
    /// Returns `false` before [`start`](Self::start), in single execution
    /// mode, or if no starter is registered for the operation.
    pub async fn start_service_session(&self, message: Message, channel: Arc<dyn ResponseChannel>) -> bool {
        start_session(&self.inner, SessionMessage::new(message, channel))
            .await
            .is_ok()
    }

    /// Tell the correlation engine that `session` changed its correlation
    /// values.
    pub fn update_correlation(&self, session: &Arc<Session>) {
        self.inner.engine.on_correlation_update(session);
    }

    #[must_use]
    pub fn is_exited(&self) -> bool {
        *self.inner.exited.borrow()
    }

    /// Wait until the router enters exiting mode.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.inner.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// Enter exiting mode, stop housekeeping, then give live sessions up to
    /// `termination_timeout` to finish. Returns the number still running.
    pub async fn shutdown(&self, termination_timeout: Duration) -> usize {
        self.inner.exit();
        if let Some(handle) = lock(&self.inner.housekeeping).take() {
            handle.abort();
        }
        let sessions: Vec<Arc<Session>> = self
            .inner
            .engine
            .sessions()
            .into_iter()
            .filter(|s| s.is_started())
            .collect();
        let joins = futures::future::join_all(sessions.iter().map(|s| s.join()));
        if tokio::time::timeout(termination_timeout, joins).await.is_err() {
            let running = sessions.iter().filter(|s| !s.is_finished()).count();
            tracing::warn!(running, "Sessions still running at shutdown");
            return running;
        }
        0
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.inner.config)
            .field("exited", &self.is_exited())
            .finish_non_exhaustive()
    }
}

async fn route(inner: &Arc<Inner>, mut message: SessionMessage) -> Result<(), RouterError> {
    if !inner.init.is_started() {
        return Err(RouterError::NotStarted);
    }
    loop {
        if *inner.exited.borrow() {
            return Err(RouterError::Exiting);
        }
        let Some(session) = inner.engine.route(&message) else {
            break;
        };
        match session.offer_message(message) {
            Ok(()) => {
                tracing::debug!(session = %session.id(), "Routed message to live session");
                return Ok(());
            }
            // Finished while we looked: wait for its listeners to untrack it.
            Err(returned) => {
                message = returned;
                session.join().await;
            }
        }
    }

    let Err(message) = start_session(inner, message).await else {
        return Ok(());
    };
    let operation = message.operation().to_string();
    tracing::warn!(operation, "Correlation error");
    let (message, channel) = message.into_parts();
    if let Err(e) = channel.send(message.fault_response(Fault::correlation_error())).await {
        tracing::debug!(error = %e, "Could not answer correlation error");
    }
    Err(RouterError::Correlation { operation })
}

/// Spawn a session for `message`, or hand it back if none may start.
async fn start_session(inner: &Arc<Inner>, message: SessionMessage) -> Result<(), SessionMessage> {
    let mode = inner.config.execution_mode;
    if mode == ExecutionMode::Single || !inner.init.is_started() {
        return Err(message);
    }
    let Some(starter) = inner.registry.starter(message.operation()) else {
        return Err(message);
    };

    inner.init.join().await;

    let body: Arc<dyn Process> = Arc::new(Sequence::new(vec![
        starter.guard().receive_message(message.clone()),
        Arc::clone(starter.body()),
    ]));
    let session = Session::spawn_from(&inner.init, SessionKind::Spawned, body, Some(message.clone()));
    inner.engine.on_session_start(&session, starter, &message);
    session.add_listener(Arc::new(SpawnedListener {
        router: Arc::downgrade(inner),
    }));

    match mode {
        ExecutionMode::Sequential => {
            let is_head = {
                let mut waiting = lock(&inner.waiting);
                waiting.push_back(Arc::clone(&session));
                waiting.len() == 1
            };
            if is_head {
                inner.launch(&session);
            } else {
                tracing::debug!(session = %session.id(), "Session queued");
            }
        }
        _ => inner.launch(&session),
    }
    Ok(())
}

/// Re-route messages the initializer left unconsumed.
fn relay(inner: &Arc<Inner>, messages: Vec<SessionMessage>) {
    if messages.is_empty() {
        return;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        for message in messages {
            if let Err(e) = route(&inner, message).await {
                tracing::debug!(error = %e, "Could not relay message");
            }
        }
    });
}

struct InitListener {
    router: Weak<Inner>,
}

impl InitListener {
    fn finish(&self, session: &Arc<Session>) -> Option<Arc<Inner>> {
        let inner = self.router.upgrade()?;
        // Register the main session before untracking the initializer so
        // uncorrelated messages always find a catch-all.
        if inner.config.execution_mode == ExecutionMode::Single && !*inner.exited.borrow() {
            if let Some(process) = inner.main_process.clone() {
                let main = Session::spawn_from(session, SessionKind::Main, process, None);
                inner.engine.on_single_execution_session_start(&main);
                main.add_listener(Arc::new(MainListener {
                    router: Weak::clone(&self.router),
                }));
                *lock(&inner.main_session) = Some(Arc::clone(&main));
                main.start();
            }
        }
        inner.engine.on_session_executed(session);
        Some(inner)
    }
}

impl SessionListener for InitListener {
    fn on_session_executed(&self, session: &Arc<Session>) {
        if let Some(inner) = self.finish(session) {
            relay(&inner, session.take_unconsumed());
        }
    }

    fn on_session_error(&self, session: &Arc<Session>, fault: &Fault) {
        let Some(inner) = self.router.upgrade() else {
            return;
        };
        inner.monitor.unhandled_fault(session.id(), fault);
        if inner.config.execution_mode == ExecutionMode::Single {
            inner.exit();
        }
        if let Some(inner) = self.finish(session) {
            relay(&inner, session.take_unconsumed());
        }
    }
}

struct MainListener {
    router: Weak<Inner>,
}

impl SessionListener for MainListener {
    fn on_session_executed(&self, session: &Arc<Session>) {
        if let Some(inner) = self.router.upgrade() {
            inner.engine.on_session_executed(session);
            inner.exit();
        }
    }

    fn on_session_error(&self, session: &Arc<Session>, fault: &Fault) {
        if let Some(inner) = self.router.upgrade() {
            inner.monitor.unhandled_fault(session.id(), fault);
            inner.engine.on_session_executed(session);
            inner.exit();
        }
    }
}

struct SpawnedListener {
    router: Weak<Inner>,
}

impl SpawnedListener {
    fn finish(&self, session: &Arc<Session>, fault: Option<&Fault>) {
        let Some(inner) = self.router.upgrade() else {
            return;
        };
        inner.engine.on_session_executed(session);
        if let Some(fault) = fault {
            inner.monitor.unhandled_fault(session.id(), fault);
        }
        let operation = session.starter_message().map_or("", SessionMessage::operation);
        inner.monitor.session_ended(operation, session.id());
        if inner.config.execution_mode == ExecutionMode::Sequential {
            inner.advance_queue(session);
        }
    }
}

impl SessionListener for SpawnedListener {
    fn on_session_executed(&self, session: &Arc<Session>) {
        self.finish(session, None);
    }

    fn on_session_error(&self, session: &Arc<Session>, fault: &Fault) {
        self.finish(session, Some(fault));
    }
}
