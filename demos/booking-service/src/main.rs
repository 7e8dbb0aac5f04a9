//! Booking service demo.
//!
//! Run with: cargo run -p booking-service [config.json]
//!
//! Opens two bookings, pays one, cancels the other and sends a message no
//! session can take. Responses and session events are logged.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use orchestra_core::{
    CorrelationSet, EventStore, ExecutionMode, Fault, Message, Response, ResponseChannel,
    RuntimeConfig, SessionMessage, traits::ChannelError,
};
use orchestra_runtime::{
    ExecutionContext, InputOperation, Router, Session, SessionStarter, process::receive_any,
    process_fn,
};
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PAYMENT_DECLINED: &str = "PaymentDeclined";

/// Logs every response it is asked to send.
struct LogChannel {
    client: &'static str,
}

#[async_trait]
impl ResponseChannel for LogChannel {
    async fn send(&self, response: Response) -> Result<(), ChannelError> {
        let body = serde_json::to_string(&response).map_err(|e| ChannelError::Io(e.into()))?;
        tracing::info!(client = self.client, %body, "Response");
        Ok(())
    }
}

fn load_config() -> anyhow::Result<RuntimeConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(RuntimeConfig {
            execution_mode: ExecutionMode::Concurrent,
            ..RuntimeConfig::default()
        });
    };
    let json = std::fs::read_to_string(&path)?;
    Ok(RuntimeConfig::from_json(&json)?)
}

async fn reply(session: &Session, message: &SessionMessage, value: Value) {
    if let Err(e) = message.channel().send(message.message().response(value)).await {
        tracing::warn!(session = %session.id(), error = %e, "Could not reply");
    }
}

/// Session body: wait for payment or cancellation of the booking.
fn booking() -> SessionStarter {
    let body = process_fn(|session: Arc<Session>, ctx: Arc<ExecutionContext>| async move {
        ctx.push_scope("booking");
        ctx.install_compensation(process_fn(|session: Arc<Session>, _ctx| async move {
            let id = session.get(&"bookingId".into()).unwrap_or_default();
            tracing::info!(booking = %id, "Releasing seats");
            Ok(())
        }));
        ctx.install_fault_handler(
            PAYMENT_DECLINED,
            process_fn(|session: Arc<Session>, _ctx| async move {
                let reason = session.get(&"booking.PaymentDeclined".into()).unwrap_or_default();
                if let Some(starter) = session.starter_message() {
                    reply(&session, starter, json!({"status": "declined", "reason": reason})).await;
                }
                Ok(())
            }),
        );

        let operations = [
            InputOperation::new("pay").with_target("payment"),
            InputOperation::new("cancel"),
        ];
        let Some((choice, message)) = receive_any(&operations, &session, &ctx).await? else {
            return Ok(());
        };
        if choice == 1 {
            if let Some(compensation) = ctx.self_compensation() {
                compensation.run(&session, &ctx).await?;
            }
            reply(&session, &message, json!({"status": "cancelled"})).await;
            return Ok(());
        }

        let amount = session
            .get(&"payment.amount".into())
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if amount == 0 {
            return Err(Fault::with_value(PAYMENT_DECLINED, json!("amount must be positive")));
        }
        reply(&session, &message, json!({"status": "confirmed", "amount": amount})).await;
        ctx.pop_scope(true);
        Ok(())
    });
    SessionStarter::new(InputOperation::new("book").with_target("request"), body)
        .with_correlation_initializer("booking")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let events = Arc::new(EventStore::new());
    let router = Router::builder(config)
        .add_correlation_set(
            CorrelationSet::builder("booking")
                .variable("bookingId")
                .alias("book", "bookingId", "id")
                .alias("pay", "bookingId", "id")
                .alias("cancel", "bookingId", "id")
                .build(),
        )
        .register(booking())
        .main(process_fn(|_session, _ctx| async move { Ok(()) }))
        .monitor(events.clone())
        .build()?;
    router.start();

    let mut stream = events.history_plus_stream();
    let printer = tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = %json, "Session event"),
                Err(e) => tracing::warn!(error = %e, "Unprintable event"),
            }
        }
    });

    let script = [
        ("alice", Message::new("book", 1, json!({"id": "B1", "seats": 2}))),
        ("bob", Message::new("book", 2, json!({"id": "B2", "seats": 1}))),
        ("carol", Message::new("book", 3, json!({"id": "B3", "seats": 4}))),
        ("alice", Message::new("pay", 4, json!({"id": "B1", "amount": 120}))),
        ("bob", Message::new("cancel", 5, json!({"id": "B2"}))),
        ("carol", Message::new("pay", 6, json!({"id": "B3", "amount": 0}))),
        ("mallory", Message::new("pay", 7, json!({"id": "B9", "amount": 5}))),
    ];
    for (client, message) in script {
        let channel: Arc<dyn ResponseChannel> = Arc::new(LogChannel { client });
        if let Err(e) = router.on_message_receive(message, channel).await {
            tracing::warn!(client, error = %e, "Message rejected");
        }
    }

    let running = router.shutdown(Duration::from_secs(2)).await;
    tracing::info!(running, "Shut down");
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    Ok(())
}
