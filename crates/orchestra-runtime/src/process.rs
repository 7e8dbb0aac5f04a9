//! Executable bodies run by sessions.
//!
//! The statement interpreter lives outside this crate; it hands bodies to
//! the runtime as [`Process`] objects.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use orchestra_core::{Fault, SessionMessage, VariablePath, fault::TYPE_MISMATCH_FAULT_NAME};

use crate::{
    context::ExecutionContext,
    session::Session,
    waiter::WaitError,
};

/// A body of work executed inside a session.
#[async_trait]
pub trait Process: Send + Sync {
    /// Run to completion on `ctx`, reading and writing `session` state.
    async fn run(&self, session: &Arc<Session>, ctx: &Arc<ExecutionContext>) -> Result<(), Fault>;
}

struct FnProcess<F>(F);

#[async_trait]
impl<F, Fut> Process for FnProcess<F>
where
    F: Fn(Arc<Session>, Arc<ExecutionContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Fault>> + Send,
{
    async fn run(&self, session: &Arc<Session>, ctx: &Arc<ExecutionContext>) -> Result<(), Fault> {
        (self.0)(Arc::clone(session), Arc::clone(ctx)).await
    }
}

/// Wrap an async closure as a process.
pub fn process_fn<F, Fut>(f: F) -> Arc<dyn Process>
where
    F: Fn(Arc<Session>, Arc<ExecutionContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Fault>> + Send + 'static,
{
    Arc::new(FnProcess(f))
}

/// Does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nop;

#[async_trait]
impl Process for Nop {
    async fn run(&self, _session: &Arc<Session>, _ctx: &Arc<ExecutionContext>) -> Result<(), Fault> {
        Ok(())
    }
}

/// Runs its children in order, stopping at the first fault.
///
/// A killed context stops the sequence at the next step boundary.
pub struct Sequence(Vec<Arc<dyn Process>>);

impl Sequence {
    #[must_use]
    pub fn new(children: Vec<Arc<dyn Process>>) -> Self {
        Self(children)
    }
}

#[async_trait]
impl Process for Sequence {
    async fn run(&self, session: &Arc<Session>, ctx: &Arc<ExecutionContext>) -> Result<(), Fault> {
        for child in &self.0 {
            if ctx.is_killed() {
                return Ok(());
            }
            child.run(session, ctx).await?;
        }
        Ok(())
    }
}

/// Built-in handler that logs the fault value stored under
/// `<scope>.<fault>`.
pub(crate) struct LogFaultValue {
    path: VariablePath,
}

impl LogFaultValue {
    pub(crate) fn new(scope: &str, fault: &str) -> Self {
        Self {
            path: VariablePath::new([scope, fault]),
        }
    }
}

#[async_trait]
impl Process for LogFaultValue {
    async fn run(&self, session: &Arc<Session>, _ctx: &Arc<ExecutionContext>) -> Result<(), Fault> {
        let value = session.get(&self.path).unwrap_or_default();
        tracing::info!(session = %session.id(), fault = %self.path, %value, "Handled built-in fault");
        Ok(())
    }
}

/// An operation a session can receive messages on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputOperation {
    id: String,
    target: Option<VariablePath>,
}

impl InputOperation {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: None,
        }
    }

    /// Store received payloads at `path` in the session state.
    #[must_use]
    pub fn with_target(mut self, path: impl Into<VariablePath>) -> Self {
        self.target = Some(path.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn target(&self) -> Option<&VariablePath> {
        self.target.as_ref()
    }

    /// Step that accepts an already received `message`, used as the first
    /// step of a spawned session.
    #[must_use]
    pub fn receive_message(&self, message: SessionMessage) -> Arc<dyn Process> {
        Arc::new(AcceptMessage {
            operation: self.clone(),
            message,
        })
    }

    /// Wait for the next message on this operation and accept it.
    ///
    /// Cancellation yields `Ok(None)`; timeouts and other delivered faults
    /// are returned as errors.
    pub async fn receive(
        &self,
        session: &Arc<Session>,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<Option<SessionMessage>, Fault> {
        settle(self, session, session.request_message(&self.id, ctx).await)
    }

    /// Like [`receive`](Self::receive), failing with a timeout fault after
    /// `timeout`.
    pub async fn receive_timeout(
        &self,
        session: &Arc<Session>,
        ctx: &Arc<ExecutionContext>,
        timeout: Duration,
    ) -> Result<Option<SessionMessage>, Fault> {
        let request = session.request_message_timeout(&self.id, ctx, timeout);
        settle(self, session, request.await)
    }

    /// Receive the reply to a solicit, timed out after the session's
    /// configured response timeout.
    pub async fn receive_reply(
        &self,
        session: &Arc<Session>,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<Option<SessionMessage>, Fault> {
        settle(self, session, session.request_reply(&self.id, ctx).await)
    }

    /// Write the payload of `message` into the target path, if any.
    ///
    /// # Errors
    /// Returns a `TypeMismatch` fault if the target cannot be written.
    pub fn accept(&self, session: &Session, message: &SessionMessage) -> Result<(), Fault> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        session
            .set(target, message.message().payload.clone())
            .map_err(|e| Fault::with_value(TYPE_MISMATCH_FAULT_NAME, e.to_string().into()))
    }
}

fn settle(
    operation: &InputOperation,
    session: &Session,
    delivery: Result<SessionMessage, WaitError>,
) -> Result<Option<SessionMessage>, Fault> {
    match delivery {
        Ok(message) => {
            operation.accept(session, &message)?;
            Ok(Some(message))
        }
        Err(WaitError::Cancelled) => Ok(None),
        Err(WaitError::Fault(fault)) => Err(fault),
    }
}

/// Wait for whichever of `operations` receives a message first, accept it
/// and return the index of the chosen operation.
///
/// Cancellation yields `Ok(None)`.
pub async fn receive_any(
    operations: &[InputOperation],
    session: &Arc<Session>,
    ctx: &Arc<ExecutionContext>,
) -> Result<Option<(usize, SessionMessage)>, Fault> {
    let ids: Vec<&str> = operations.iter().map(InputOperation::id).collect();
    let delivery = session.request_any(&ids, ctx).await;
    match delivery {
        Ok(message) => {
            let Some(index) = ids.iter().position(|id| *id == message.operation()) else {
                return Ok(None);
            };
            operations[index].accept(session, &message)?;
            Ok(Some((index, message)))
        }
        Err(WaitError::Cancelled) => Ok(None),
        Err(WaitError::Fault(fault)) => Err(fault),
    }
}

struct AcceptMessage {
    operation: InputOperation,
    message: SessionMessage,
}

#[async_trait]
impl Process for AcceptMessage {
    async fn run(&self, session: &Arc<Session>, _ctx: &Arc<ExecutionContext>) -> Result<(), Fault> {
        self.operation.accept(session, &self.message)
    }
}
