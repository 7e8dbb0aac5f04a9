//! Pending message requests.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use orchestra_core::{Fault, SessionMessage};
use tokio::{sync::oneshot, time::Instant};

use crate::lock;

/// Why a message request resolved without a message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WaitError {
    /// The owning execution context was killed. Not a fault.
    #[error("Message request cancelled")]
    Cancelled,
    /// A fault was delivered instead of a message, e.g. a timeout.
    #[error(transparent)]
    Fault(#[from] Fault),
}

/// Outcome of a message request.
pub type Delivery = Result<SessionMessage, WaitError>;

/// Asynchronous work that an execution context can cancel when killed.
pub trait Cancellable: Send + Sync {
    /// Cancel if still pending. Returns `true` if this call cancelled it.
    fn cancel(&self) -> bool;

    /// Whether the work is fulfilled, cancelled, or abandoned by its owner.
    fn is_done(&self) -> bool;
}

/// Shared half of a message request, registered in a session's waiter table.
///
/// Settled at most once.
pub(crate) struct Waiter {
    operations: Vec<String>,
    deadline: Option<Instant>,
    tx: Mutex<Option<oneshot::Sender<Delivery>>>,
}

impl Waiter {
    pub(crate) fn new(operations: &[&str], deadline: Option<Instant>) -> (Arc<Self>, MessageFuture) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Self {
            operations: operations.iter().map(ToString::to_string).collect(),
            deadline,
            tx: Mutex::new(Some(tx)),
        });
        let future = MessageFuture {
            rx,
            waiter: Arc::clone(&waiter),
        };
        (waiter, future)
    }

    pub(crate) fn operations(&self) -> &[String] {
        &self.operations
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Hand `message` to the requester. Gives the message back if the
    /// waiter was already settled or its handle was dropped.
    pub(crate) fn deliver(&self, message: SessionMessage) -> Result<(), SessionMessage> {
        match self.settle(Ok(message)) {
            Err(Ok(message)) => Err(message),
            _ => Ok(()),
        }
    }

    /// Resolve the request with an error.
    pub(crate) fn fail(&self, error: WaitError) -> bool {
        self.settle(Err(error)).is_ok()
    }

    fn settle(&self, delivery: Delivery) -> Result<(), Delivery> {
        let Some(tx) = lock(&self.tx).take() else {
            return Err(delivery);
        };
        tx.send(delivery)
    }
}

impl Cancellable for Waiter {
    fn cancel(&self) -> bool {
        self.fail(WaitError::Cancelled)
    }

    fn is_done(&self) -> bool {
        lock(&self.tx).as_ref().is_none_or(oneshot::Sender::is_closed)
    }
}

/// Handle to a pending message request.
///
/// Resolves with the message, with [`WaitError::Cancelled`] if the
/// requesting context was killed, or with a fault.
pub struct MessageFuture {
    rx: oneshot::Receiver<Delivery>,
    waiter: Arc<Waiter>,
}

impl MessageFuture {
    /// Cancel the request if it is still pending.
    pub fn cancel(&self) -> bool {
        self.waiter.cancel()
    }

    /// Whether the request has been settled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.waiter.is_done()
    }
}

impl Future for MessageFuture {
    type Output = Delivery;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(WaitError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use orchestra_core::{Message, Response, ResponseChannel, traits::ChannelError};
    use serde_json::json;

    use super::*;

    struct NullChannel;

    #[async_trait]
    impl ResponseChannel for NullChannel {
        async fn send(&self, _response: Response) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn message(op: &str) -> SessionMessage {
        SessionMessage::new(Message::new(op, 1, json!(null)), Arc::new(NullChannel))
    }

    #[tokio::test]
    async fn test_waiter_settles_once() {
        let (waiter, future) = Waiter::new(&["confirm"], None);
        assert!(waiter.deliver(message("confirm")).is_ok());
        assert!(waiter.is_done());

        let returned = waiter.deliver(message("confirm")).unwrap_err();
        assert_eq!(returned.operation(), "confirm");
        assert!(!waiter.cancel());

        assert_eq!(future.await.unwrap().operation(), "confirm");
    }

    #[tokio::test]
    async fn test_dropped_handle_returns_message() {
        let (waiter, future) = Waiter::new(&["confirm"], None);
        drop(future);
        assert!(waiter.is_done());
        assert!(waiter.deliver(message("confirm")).is_err());
    }

    #[tokio::test]
    async fn test_cancel_resolves_cancelled() {
        let (_waiter, future) = Waiter::new(&["confirm"], None);
        assert!(future.cancel());
        assert_eq!(future.await.unwrap_err(), WaitError::Cancelled);
    }
}
