//! Durable LISTEN/NOTIFY subscriptions.
//!
//! Each subscription owns a dedicated connection, independent of the query
//! pools, and re-establishes it with exponential backoff whenever it dies.
//! Connection errors are logged and retried, never surfaced to the caller.

pub mod postgres;
pub mod state;
pub mod subscription;

pub use postgres::{PgListenConnector, PgListenSession};
pub use state::{DEFAULT_BACKOFF, MAX_BACKOFF, SubscriptionState};
pub use subscription::{SubscriptionHandle, SubscriptionStats};

use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// A notification delivered on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    /// Backend PID of the notifying session.
    pub process_id: u32,
}

/// Opens dedicated, unpooled listen connections.
#[async_trait]
pub trait ListenConnector: Send + Sync {
    async fn connect(&self) -> DbResult<Box<dyn ListenSession>>;
}

/// One live listen connection. Dropping it closes the connection.
#[async_trait]
pub trait ListenSession: Send {
    async fn listen(&mut self, channel: &str) -> DbResult<()>;

    /// Wait for the next notification. An error means the connection is gone.
    async fn recv(&mut self) -> DbResult<Notification>;
}

/// Business logic for received notifications.
///
/// Returning an error acknowledges negatively: the connection is closed and
/// re-established after the current backoff.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: Notification) -> DbResult<()>;
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DbResult<()>> + Send + 'static,
{
    async fn handle(&self, notification: Notification) -> DbResult<()> {
        (self)(notification).await
    }
}

/// Subscribe `handler` to `channel` and return the subscription's handle.
///
/// The subscription runs until [`SubscriptionHandle::stop`] is called.
pub fn listen_notify<H>(
    connector: Arc<dyn ListenConnector>,
    channel: impl Into<String>,
    handler: H,
) -> SubscriptionHandle
where
    H: NotificationHandler + 'static,
{
    subscription::spawn(connector, channel.into(), Arc::new(handler))
}

/// Keeps track of the subscriptions opened through one connector.
pub struct Listener {
    connector: Arc<dyn ListenConnector>,
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
}

impl Listener {
    pub fn new(connector: Arc<dyn ListenConnector>) -> Self {
        Self {
            connector,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Listener opening its connections from a Postgres URL.
    pub fn postgres(url: &str) -> DbResult<Self> {
        Ok(Self::new(Arc::new(PgListenConnector::from_url(url)?)))
    }

    /// Start listening on `channel`. Fire-and-forget: connection problems are
    /// handled by the subscription itself.
    pub async fn subscribe<H>(&self, channel: &str, handler: H) -> DbResult<()>
    where
        H: NotificationHandler + 'static,
    {
        if channel.is_empty() {
            return Err(DbError::invalid_input("Channel name cannot be empty"));
        }

        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(channel) {
            return Err(DbError::invalid_input(format!(
                "Already subscribed to channel '{channel}'"
            )));
        }

        let handle = listen_notify(Arc::clone(&self.connector), channel, handler);
        subscriptions.insert(channel.to_string(), handle);
        info!(channel, "Subscribed");
        Ok(())
    }

    /// Stop the subscription on `channel`. Returns whether one existed.
    pub async fn unsubscribe(&self, channel: &str) -> bool {
        let handle = self.subscriptions.lock().await.remove(channel);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Channels with a running subscription, sorted.
    pub async fn channels(&self) -> Vec<String> {
        let subscriptions = self.subscriptions.lock().await;
        let mut channels: Vec<String> = subscriptions.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub async fn stats(&self, channel: &str) -> Option<SubscriptionStats> {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions.get(channel).map(SubscriptionHandle::stats)
    }

    /// Stop every subscription.
    pub async fn shutdown(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop().await;
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}
