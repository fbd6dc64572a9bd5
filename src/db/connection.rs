//! Seams between the lease manager and the physical database driver.
//!
//! The lease, transaction and cursor logic only ever talks to these traits.
//! [`crate::db::postgres`] implements them on top of `sqlx`; tests implement
//! them with scripted in-memory connections.

use crate::config::PoolConfig;
use crate::error::DbResult;
use crate::models::{QueryOutput, QueryParam, Row};
use async_trait::async_trait;
use std::sync::Arc;

/// One physical connection checked out from a [`ConnectionSource`].
///
/// Dropping the box hands the connection back to the physical pool.
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement and return its normalized result.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryOutput>;

    /// Declare a forward-only server-side cursor. Must run inside a transaction.
    async fn open_cursor(&mut self, name: &str, sql: &str, params: &[QueryParam]) -> DbResult<()> {
        let declare = format!("DECLARE {name} NO SCROLL CURSOR FOR {sql}");
        self.execute(&declare, params).await.map(|_| ())
    }

    /// Fetch up to `count` rows from a cursor declared on this connection.
    async fn fetch(&mut self, name: &str, count: u32) -> DbResult<Vec<Row>> {
        let fetch = format!("FETCH FORWARD {count} FROM {name}");
        self.execute(&fetch, &[]).await.map(|output| output.rows)
    }
}

/// A physical connection pool.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn acquire(&self) -> DbResult<Box<dyn Connection>>;
}

/// Opens physical pools for a configuration.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn open(&self, config: &PoolConfig) -> DbResult<Arc<dyn ConnectionSource>>;
}
