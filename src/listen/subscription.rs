//! The reconnecting subscription task.
//!
//! ```text
//! Connecting -> Listening -> (Error -> Backoff -> Connecting)*
//!      \___________\_____________\_________-> Stopped
//! ```
//!
//! The task runs until its stop signal fires. Dropping the
//! [`SubscriptionHandle`] without calling [`SubscriptionHandle::stop`] detaches
//! the task, which then keeps running for the life of the runtime.

use super::state::SubscriptionState;
use super::{ListenConnector, NotificationHandler};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Statistics about a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub channel: String,
    pub connected: bool,
    pub events_received: u64,
    pub connection_errors: u64,
    pub reconnects: u64,
    pub backoff: Duration,
}

#[derive(Debug, Default)]
struct SharedStats {
    connected: AtomicBool,
    events_received: AtomicU64,
    connection_errors: AtomicU64,
    reconnects: AtomicU64,
    backoff_ms: AtomicU64,
}

/// Resolves when stop was requested. Pends forever once the handle detached.
struct StopSignal {
    rx: Option<oneshot::Receiver<()>>,
}

impl StopSignal {
    async fn stopped(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.await.is_ok() {
                return;
            }
            // Sender dropped without stopping: detached.
            self.rx = None;
        }
        std::future::pending::<()>().await
    }
}

/// Control handle of a running subscription.
pub struct SubscriptionHandle {
    channel: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    stats: Arc<SharedStats>,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop the subscription and wait for its connection to close.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if e.is_panic() {
                warn!(channel = %self.channel, "Subscription task panicked");
            }
        }
        info!(channel = %self.channel, "Subscription stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            channel: self.channel.clone(),
            connected: self.stats.connected.load(Ordering::Relaxed),
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            connection_errors: self.stats.connection_errors.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            backoff: Duration::from_millis(self.stats.backoff_ms.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("channel", &self.channel)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Spawn the subscription task for `channel`.
pub(crate) fn spawn(
    connector: Arc<dyn ListenConnector>,
    channel: String,
    handler: Arc<dyn NotificationHandler>,
) -> SubscriptionHandle {
    let (tx, rx) = oneshot::channel();
    let stats = Arc::new(SharedStats::default());
    let state = SubscriptionState::new(channel.clone());
    stats
        .backoff_ms
        .store(state.backoff().as_millis() as u64, Ordering::Relaxed);

    let task = tokio::spawn(run(
        connector,
        state,
        handler,
        Arc::clone(&stats),
        StopSignal { rx: Some(rx) },
    ));

    SubscriptionHandle {
        channel,
        stop: Some(tx),
        task,
        stats,
    }
}

async fn run(
    connector: Arc<dyn ListenConnector>,
    mut state: SubscriptionState,
    handler: Arc<dyn NotificationHandler>,
    stats: Arc<SharedStats>,
    mut stop: StopSignal,
) {
    loop {
        state.begin_attempt();

        let delay = tokio::select! {
            biased;
            _ = stop.stopped() => break,
            delay = run_session(connector.as_ref(), &mut state, handler.as_ref(), &stats) => delay,
        };

        stats.connected.store(false, Ordering::Relaxed);
        stats
            .backoff_ms
            .store(state.backoff().as_millis() as u64, Ordering::Relaxed);
        info!(
            channel = %state.channel(),
            delay_ms = delay.as_millis() as u64,
            retries = state.retries(),
            "Reconnecting LISTEN subscription after backoff"
        );

        tokio::select! {
            biased;
            _ = stop.stopped() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        stats.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    stats.connected.store(false, Ordering::Relaxed);
    debug!(channel = %state.channel(), "Subscription task exited");
}

/// Connect, LISTEN and dispatch notifications until the session fails.
///
/// Returns the delay to wait before the next attempt. The session is closed
/// when this returns (or when the future is dropped on stop).
async fn run_session(
    connector: &dyn ListenConnector,
    state: &mut SubscriptionState,
    handler: &dyn NotificationHandler,
    stats: &SharedStats,
) -> Duration {
    let mut session = match connector.connect().await {
        Ok(session) => session,
        Err(e) => {
            stats.connection_errors.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %state.channel(), error = %e, "LISTEN/NOTIFY connection failed");
            return state.on_connection_error().unwrap_or(state.backoff());
        }
    };

    if let Err(e) = session.listen(state.channel()).await {
        warn!(channel = %state.channel(), error = %e, "LISTEN failed");
        return state.on_listen_failure();
    }

    stats.connected.store(true, Ordering::Relaxed);
    info!(channel = %state.channel(), "Listening for notifications");

    loop {
        match session.recv().await {
            Ok(notification) => {
                state.on_notification();
                stats.events_received.fetch_add(1, Ordering::Relaxed);
                stats
                    .backoff_ms
                    .store(state.backoff().as_millis() as u64, Ordering::Relaxed);
                debug!(
                    channel = %notification.channel,
                    process_id = notification.process_id,
                    "Notification received"
                );

                if let Err(e) = handler.handle(notification).await {
                    warn!(
                        channel = %state.channel(),
                        error = %e,
                        "Notification handler failed, closing connection"
                    );
                    return state.on_handler_rejected();
                }
            }
            Err(e) => {
                stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %state.channel(), error = %e, "LISTEN/NOTIFY error");
                return state.on_connection_error().unwrap_or(state.backoff());
            }
        }
    }
}
