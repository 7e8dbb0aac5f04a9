//! Periodic sweep of expired waiters.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::session::Session;

/// Spawn the sweeper. It stops once `exiting` turns true or `sessions`
/// returns `None`.
pub(crate) fn spawn_sweeper<F>(period: Duration, mut exiting: watch::Receiver<bool>, sessions: F) -> JoinHandle<()>
where
    F: Fn() -> Option<Vec<Arc<Session>>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = exiting.wait_for(|exiting| *exiting) => break,
                _ = ticker.tick() => {
                    let Some(sessions) = sessions() else {
                        break;
                    };
                    let now = Instant::now();
                    let expired: usize = sessions.iter().map(|s| s.sweep_expired_waiters(now)).sum();
                    if expired > 0 {
                        tracing::debug!(expired, "Swept expired waiters");
                    }
                }
            }
        }
        tracing::debug!("Housekeeping stopped");
    })
}
