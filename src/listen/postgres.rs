//! `sqlx::PgListener` sessions.

use super::{ListenConnector, ListenSession, Notification};
use crate::config::PoolConfig;
use crate::db::postgres::PgDriver;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};

/// Opens one dedicated connection per session.
#[derive(Debug, Clone)]
pub struct PgListenConnector {
    options: PgConnectOptions,
}

impl PgListenConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &PoolConfig) -> DbResult<Self> {
        Ok(Self::new(PgDriver::connect_options(config)?))
    }

    pub fn from_url(url: &str) -> DbResult<Self> {
        Self::from_config(&PoolConfig::parse(url)?)
    }
}

#[async_trait]
impl ListenConnector for PgListenConnector {
    async fn connect(&self) -> DbResult<Box<dyn ListenSession>> {
        // Single-connection pool owned by the listener, never shared with queries.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(self.options.clone());
        let listener = PgListener::connect_with(&pool).await?;
        Ok(Box::new(PgListenSession { listener }))
    }
}

pub struct PgListenSession {
    listener: PgListener,
}

#[async_trait]
impl ListenSession for PgListenSession {
    async fn listen(&mut self, channel: &str) -> DbResult<()> {
        self.listener.listen(channel).await?;
        Ok(())
    }

    async fn recv(&mut self) -> DbResult<Notification> {
        // `try_recv` yields None when the connection dropped. Reconnecting is
        // the subscription's job, so report it instead of letting sqlx retry.
        match self.listener.try_recv().await? {
            Some(notification) => Ok(Notification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
                process_id: notification.process_id(),
            }),
            None => Err(DbError::connection(
                "LISTEN connection lost",
                "Check database server status; the subscription reconnects automatically",
            )),
        }
    }
}

impl std::fmt::Debug for PgListenSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgListenSession").finish_non_exhaustive()
    }
}
