//! Router integration tests
//!
//! Drive a router end to end through its public API.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use orchestra_core::{
    CorrelationAlgorithm, CorrelationSet, EventStore, ExecutionMode, Fault, Message, Outcome, Response,
    ResponseChannel, RuntimeConfig, SessionEvent, fault::TIMEOUT_FAULT_NAME, traits::ChannelError,
};
use orchestra_runtime::{
    BuildError, ExecutionContext, InputOperation, Router, RouterError, Session, SessionKind,
    SessionStarter, process::Nop, process_fn,
};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

struct RecordingChannel(mpsc::UnboundedSender<Response>);

#[async_trait]
impl ResponseChannel for RecordingChannel {
    async fn send(&self, response: Response) -> Result<(), ChannelError> {
        self.0.send(response).map_err(|_| ChannelError::Closed)
    }
}

fn channel() -> (Arc<dyn ResponseChannel>, mpsc::UnboundedReceiver<Response>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingChannel(tx)), rx)
}

async fn next_response(rx: &mut mpsc::UnboundedReceiver<Response>) -> Response {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no response in time")
        .expect("channel closed")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn config(mode: ExecutionMode) -> RuntimeConfig {
    RuntimeConfig {
        execution_mode: mode,
        housekeeping_interval_ms: 10,
        ..RuntimeConfig::default()
    }
}

fn ended(events: &EventStore) -> usize {
    events
        .history()
        .iter()
        .filter(|e| matches!(e, SessionEvent::Ended { .. }))
        .count()
}

fn order_set() -> CorrelationSet {
    CorrelationSet::builder("order")
        .variable("orderId")
        .alias("open", "orderId", "id")
        .alias("confirm", "orderId", "id")
        .build()
}

/// Receives `confirm` and answers it with the session id.
fn confirm_order() -> SessionStarter {
    let body = process_fn(|session: Arc<Session>, ctx: Arc<ExecutionContext>| async move {
        let confirm = InputOperation::new("confirm").with_target("confirmation");
        if let Some(message) = confirm.receive(&session, &ctx).await? {
            let (message, channel) = message.into_parts();
            let _ = channel.send(message.response(json!(session.id().0))).await;
        }
        Ok(())
    });
    SessionStarter::new(InputOperation::new("open"), body).with_correlation_initializer("order")
}

async fn correlated_message_reaches_live_session(algorithm: CorrelationAlgorithm) {
    let events = Arc::new(EventStore::new());
    let stray_starts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stray_starts);

    let router = Router::builder(RuntimeConfig {
        correlation_algorithm: algorithm,
        ..config(ExecutionMode::Concurrent)
    })
    .add_correlation_set(order_set())
    .register(confirm_order())
    .register(SessionStarter::new(
        InputOperation::new("confirm"),
        process_fn(move |_session, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    ))
    .monitor(events.clone())
    .build()
    .unwrap();
    router.start();

    let (tx, mut rx) = channel();
    router
        .on_message_receive(Message::new("open", 1, json!({"id": "X1"})), Arc::clone(&tx))
        .await
        .unwrap();
    let session = router
        .sessions()
        .into_iter()
        .find(|s| s.kind() == SessionKind::Spawned)
        .unwrap();
    assert_eq!(session.get(&"orderId".into()), Some(json!("X1")));

    router
        .on_message_receive(Message::new("confirm", 2, json!({"id": "X1"})), tx)
        .await
        .unwrap();
    let response = next_response(&mut rx).await;
    assert_eq!(response.id, 2);
    assert_eq!(response.outcome, Outcome::Value(json!(session.id().0)));

    eventually(|| ended(&events) == 1).await;
    assert_eq!(stray_starts.load(Ordering::SeqCst), 0);
    assert!(router.sessions().iter().all(|s| s.kind() != SessionKind::Spawned));
}

#[tokio::test]
async fn test_correlated_message_reaches_live_session() {
    correlated_message_reaches_live_session(CorrelationAlgorithm::Simple).await;
}

#[tokio::test]
async fn test_correlated_message_reaches_live_session_hash() {
    correlated_message_reaches_live_session(CorrelationAlgorithm::Hash).await;
}

#[tokio::test]
async fn test_unroutable_message_is_answered_with_fault() {
    let router = Router::builder(config(ExecutionMode::Concurrent))
        .add_correlation_set(order_set())
        .register(confirm_order())
        .build()
        .unwrap();
    router.start();

    let (tx, mut rx) = channel();
    let err = router
        .on_message_receive(Message::new("confirm", 5, json!({"id": "nope"})), tx)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RouterError::Correlation {
            operation: "confirm".to_string()
        }
    );

    let response = next_response(&mut rx).await;
    assert_eq!(response.id, 5);
    match response.outcome {
        Outcome::Fault(fault) => assert_eq!(fault.name, "CorrelationError"),
        Outcome::Value(value) => panic!("expected fault, got {value}"),
    }
}

#[tokio::test]
async fn test_sequential_sessions_run_in_arrival_order() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let body_log = Arc::clone(&log);
    let body = process_fn(move |session: Arc<Session>, ctx: Arc<ExecutionContext>| {
        let log = Arc::clone(&body_log);
        async move {
            let job = session.get(&"jobId".into()).unwrap_or_default();
            log.lock().unwrap().push(format!("start:{job}"));
            InputOperation::new("finish").receive(&session, &ctx).await?;
            log.lock().unwrap().push(format!("end:{job}"));
            Ok(())
        }
    });
    let set = CorrelationSet::builder("job")
        .variable("jobId")
        .alias("job", "jobId", "id")
        .alias("finish", "jobId", "id")
        .build();
    let events = Arc::new(EventStore::new());
    let router = Router::builder(config(ExecutionMode::Sequential))
        .add_correlation_set(set)
        .register(SessionStarter::new(InputOperation::new("job"), body).with_correlation_initializer("job"))
        .monitor(events.clone())
        .build()
        .unwrap();
    router.start();

    let (tx, _rx) = channel();
    for id in 1..=2 {
        router
            .on_message_receive(Message::new("job", id, json!({"id": id})), Arc::clone(&tx))
            .await
            .unwrap();
    }
    eventually(|| log.lock().unwrap().len() == 1).await;
    assert_eq!(router.waiting_sessions(), 2);

    // Queued before its session starts.
    router
        .on_message_receive(Message::new("finish", 3, json!({"id": 2})), Arc::clone(&tx))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*log.lock().unwrap(), vec!["start:1"]);

    router
        .on_message_receive(Message::new("finish", 4, json!({"id": 1})), tx)
        .await
        .unwrap();
    eventually(|| ended(&events) == 2).await;
    assert_eq!(*log.lock().unwrap(), vec!["start:1", "end:1", "start:2", "end:2"]);
    assert_eq!(router.waiting_sessions(), 0);
}

#[tokio::test]
async fn test_concurrent_sessions_notify_once_each() {
    let events = Arc::new(EventStore::new());
    let router = Router::builder(config(ExecutionMode::Concurrent))
        .register(SessionStarter::new(InputOperation::new("a"), Arc::new(Nop)))
        .register(SessionStarter::new(InputOperation::new("b"), Arc::new(Nop)))
        .monitor(events.clone())
        .build()
        .unwrap();
    router.start();

    let (tx, _rx) = channel();
    let (a, b) = tokio::join!(
        router.on_message_receive(Message::new("a", 1, Value::Null), Arc::clone(&tx)),
        router.on_message_receive(Message::new("b", 2, Value::Null), Arc::clone(&tx)),
    );
    a.unwrap();
    b.unwrap();

    eventually(|| ended(&events) == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let history = events.history();
    for operation in ["a", "b"] {
        let starts = history
            .iter()
            .filter(|e| matches!(e, SessionEvent::Started { operation: op, .. } if op == operation))
            .count();
        let ends = history
            .iter()
            .filter(|e| matches!(e, SessionEvent::Ended { operation: op, .. } if op == operation))
            .count();
        assert_eq!((starts, ends), (1, 1), "operation {operation}");
    }
}

#[tokio::test]
async fn test_single_mode_routes_to_main_and_exits() {
    let main = process_fn(|session: Arc<Session>, ctx: Arc<ExecutionContext>| async move {
        let ping = InputOperation::new("ping").with_target("last");
        if let Some(message) = ping.receive(&session, &ctx).await? {
            let greeting = session.get(&"greeting".into()).unwrap_or_default();
            let (message, channel) = message.into_parts();
            let _ = channel.send(message.response(greeting)).await;
        }
        Ok(())
    });
    let init = process_fn(|session: Arc<Session>, _ctx| async move {
        session.set(&"greeting".into(), json!("hello")).ok();
        Ok(())
    });
    let router = Router::builder(config(ExecutionMode::Single))
        .init(init)
        .main(main)
        .build()
        .unwrap();
    router.start();

    let (tx, mut rx) = channel();
    router
        .on_message_receive(Message::new("ping", 1, json!("hi")), Arc::clone(&tx))
        .await
        .unwrap();
    let response = next_response(&mut rx).await;
    assert_eq!(response.outcome, Outcome::Value(json!("hello")));

    tokio::time::timeout(Duration::from_secs(5), router.wait_for_exit())
        .await
        .unwrap();
    assert!(router.is_exited());
    assert_eq!(
        router
            .on_message_receive(Message::new("ping", 2, Value::Null), tx)
            .await,
        Err(RouterError::Exiting)
    );
}

#[tokio::test]
async fn test_initializer_messages_are_relayed() {
    let gate = Arc::new(Notify::new());
    let init_gate = Arc::clone(&gate);
    let init = process_fn(move |_session, _ctx| {
        let gate = Arc::clone(&init_gate);
        async move {
            gate.notified().await;
            Ok(())
        }
    });
    let main = process_fn(|session: Arc<Session>, ctx: Arc<ExecutionContext>| async move {
        if let Some(message) = InputOperation::new("ping").receive(&session, &ctx).await? {
            let (message, channel) = message.into_parts();
            let _ = channel.send(message.response(json!(session.kind() == SessionKind::Main))).await;
        }
        Ok(())
    });
    let router = Router::builder(config(ExecutionMode::Single))
        .init(init)
        .main(main)
        .build()
        .unwrap();
    router.start();

    let (tx, mut rx) = channel();
    router
        .on_message_receive(Message::new("ping", 1, Value::Null), tx)
        .await
        .unwrap();
    assert_eq!(router.init_session().queued_messages("ping"), 1);
    assert!(router.main_session().is_none());

    gate.notify_one();
    let response = next_response(&mut rx).await;
    assert_eq!(response.outcome, Outcome::Value(json!(true)));
}

#[tokio::test]
async fn test_timeout_fault_reaches_handler() {
    let body = process_fn(|session: Arc<Session>, ctx: Arc<ExecutionContext>| async move {
        ctx.push_scope("hold");
        ctx.install_fault_handler(
            TIMEOUT_FAULT_NAME,
            process_fn(|session: Arc<Session>, _ctx| async move {
                if let Some(starter) = session.starter_message() {
                    let value = session.get(&"hold.Timeout".into()).unwrap_or_default();
                    let _ = starter.channel().send(starter.message().response(value)).await;
                }
                Ok(())
            }),
        );
        InputOperation::new("reply")
            .receive_timeout(&session, &ctx, Duration::from_millis(20))
            .await?;
        ctx.pop_scope(true);
        Ok(())
    });
    let events = Arc::new(EventStore::new());
    let router = Router::builder(config(ExecutionMode::Concurrent))
        .register(SessionStarter::new(InputOperation::new("hold"), body))
        .monitor(events.clone())
        .build()
        .unwrap();
    router.start();

    let (tx, mut rx) = channel();
    router
        .on_message_receive(Message::new("hold", 1, Value::Null), tx)
        .await
        .unwrap();
    let response = next_response(&mut rx).await;
    assert_eq!(
        response.outcome,
        Outcome::Value(json!("Timed out waiting for operation reply"))
    );

    eventually(|| ended(&events) == 1).await;
    assert!(
        !events
            .history()
            .iter()
            .any(|e| matches!(e, SessionEvent::UnhandledFault { .. }))
    );
}

#[tokio::test]
async fn test_reply_timeout_comes_from_config() {
    let body = process_fn(|session: Arc<Session>, ctx: Arc<ExecutionContext>| async move {
        ctx.push_scope("quote");
        ctx.install_fault_handler(
            TIMEOUT_FAULT_NAME,
            process_fn(|session: Arc<Session>, _ctx| async move {
                if let Some(starter) = session.starter_message() {
                    let value = session.get(&"quote.Timeout".into()).unwrap_or_default();
                    let _ = starter.channel().send(starter.message().response(value)).await;
                }
                Ok(())
            }),
        );
        InputOperation::new("price").receive_reply(&session, &ctx).await?;
        ctx.pop_scope(true);
        Ok(())
    });
    let router = Router::builder(RuntimeConfig {
        response_timeout_ms: 20,
        ..config(ExecutionMode::Concurrent)
    })
    .register(SessionStarter::new(InputOperation::new("quote"), body))
    .build()
    .unwrap();
    router.start();

    let (tx, mut rx) = channel();
    router
        .on_message_receive(Message::new("quote", 1, Value::Null), tx)
        .await
        .unwrap();
    let response = next_response(&mut rx).await;
    assert_eq!(
        response.outcome,
        Outcome::Value(json!("Timed out waiting for operation price"))
    );
}

#[tokio::test]
async fn test_killed_session_ends_quietly() {
    let events = Arc::new(EventStore::new());
    let router = Router::builder(config(ExecutionMode::Concurrent))
        .add_correlation_set(order_set())
        .register(confirm_order())
        .monitor(events.clone())
        .build()
        .unwrap();
    router.start();

    let (tx, mut rx) = channel();
    for (id, order) in [(1, "X1"), (2, "X2")] {
        router
            .on_message_receive(Message::new("open", id, json!({"id": order})), Arc::clone(&tx))
            .await
            .unwrap();
    }
    let find = |order: &str| {
        router
            .sessions()
            .into_iter()
            .find(|s| s.get(&"orderId".into()) == Some(json!(order)) && s.kind() == SessionKind::Spawned)
            .unwrap()
    };
    let (doomed, survivor) = (find("X1"), find("X2"));
    eventually(|| doomed.pending_waiters("confirm") == 1).await;

    assert_eq!(doomed.context().kill(Fault::new("Stop")), 1);
    eventually(|| ended(&events) == 1).await;
    assert!(doomed.is_finished());
    assert!(!survivor.is_finished());

    router
        .on_message_receive(Message::new("confirm", 3, json!({"id": "X2"})), tx)
        .await
        .unwrap();
    let response = next_response(&mut rx).await;
    assert_eq!(response.outcome, Outcome::Value(json!(survivor.id().0)));

    eventually(|| ended(&events) == 2).await;
    assert!(
        !events
            .history()
            .iter()
            .any(|e| matches!(e, SessionEvent::UnhandledFault { .. }))
    );
}

#[tokio::test]
async fn test_unhandled_fault_is_reported() {
    let body = process_fn(|_session, _ctx| async move {
        Err(Fault::with_value("OutOfStock", json!({"sku": 42})))
    });
    let events = Arc::new(EventStore::new());
    let router = Router::builder(config(ExecutionMode::Concurrent))
        .register(SessionStarter::new(InputOperation::new("buy"), body))
        .monitor(events.clone())
        .build()
        .unwrap();
    router.start();

    let (tx, _rx) = channel();
    router
        .on_message_receive(Message::new("buy", 1, Value::Null), tx)
        .await
        .unwrap();
    eventually(|| ended(&events) == 1).await;
    let faults: Vec<_> = events
        .history()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::UnhandledFault { fault, .. } => Some(fault.name),
            _ => None,
        })
        .collect();
    assert_eq!(faults, vec!["OutOfStock"]);
    assert!(!router.is_exited());
}

#[tokio::test]
async fn test_single_mode_refuses_to_spawn() {
    let router = Router::builder(config(ExecutionMode::Single))
        .register(SessionStarter::new(InputOperation::new("a"), Arc::new(Nop)))
        .main(Arc::new(Nop))
        .build()
        .unwrap();
    let (tx, _rx) = channel();
    assert!(!router.start_service_session(Message::new("a", 1, Value::Null), tx).await);
}

#[tokio::test]
async fn test_messages_before_start_are_refused() {
    let router = Router::builder(config(ExecutionMode::Concurrent))
        .register(SessionStarter::new(InputOperation::new("a"), Arc::new(Nop)))
        .build()
        .unwrap();
    let (tx, _rx) = channel();
    let started = tokio::time::timeout(
        Duration::from_secs(5),
        router.start_service_session(Message::new("a", 1, Value::Null), Arc::clone(&tx)),
    )
    .await
    .unwrap();
    assert!(!started);
    assert_eq!(
        router.on_message_receive(Message::new("a", 2, Value::Null), tx).await,
        Err(RouterError::NotStarted)
    );
}

#[test]
fn test_build_validation() {
    let err = Router::builder(config(ExecutionMode::Single)).build().unwrap_err();
    assert_eq!(err, BuildError::MissingMain);

    let nop = || Arc::new(Nop);
    let err = Router::builder(config(ExecutionMode::Concurrent))
        .register(SessionStarter::new(InputOperation::new("a"), nop()))
        .register(SessionStarter::new(InputOperation::new("a"), nop()))
        .build()
        .unwrap_err();
    assert_eq!(err, BuildError::DuplicateStarter("a".to_string()));
}
