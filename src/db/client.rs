//! Query entry points: round-trip queries, transactions and cursors.

use crate::config::PoolConfig;
use crate::db::cursor::Cursor;
use crate::db::lease::Lease;
use crate::db::registry::{Pool, PoolRegistry};
use crate::error::{DbError, DbResult};
use crate::models::{QueryOutput, QuerySnapshot, SqlTemplate};
use crate::template::{self, Substitutions};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Anything queries can be issued through.
///
/// Implemented by [`DbClient`] (one pooled round-trip per query) and by
/// [`Transaction`] (every query pinned to the transaction's connection), so
/// helpers can run either inside or outside a transaction.
#[async_trait]
pub trait Queryable: Send {
    async fn query(
        &mut self,
        template: &SqlTemplate,
        substitutions: Option<&Substitutions>,
    ) -> DbResult<QueryOutput>;
}

/// Client bound to the pool of one connection identity.
#[derive(Debug, Clone)]
pub struct DbClient {
    pool: Arc<Pool>,
}

impl DbClient {
    /// Bind to the registry's pool for `config`, creating it on first use.
    pub async fn connect(registry: &PoolRegistry, config: &PoolConfig) -> DbResult<Self> {
        let pool = registry.pool_for(config).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Run one statement on a freshly leased connection.
    ///
    /// The connection goes back to the pool whether the statement succeeded
    /// or failed.
    pub async fn query(
        &self,
        template: &SqlTemplate,
        substitutions: Option<&Substitutions>,
    ) -> DbResult<QueryOutput> {
        let compiled = template::compile(template, substitutions)?;
        let mut lease = self.pool.acquire().await?;
        let result = lease.execute(&compiled.query, &compiled.values).await;
        lease.release();
        result
    }

    /// Lease a connection and open a transaction on it.
    ///
    /// If BEGIN fails, a best-effort ROLLBACK is issued and the connection is
    /// released before the error is returned.
    pub async fn transaction_start(&self) -> DbResult<Transaction> {
        let mut lease = self.pool.acquire().await?;

        if let Err(e) = lease.begin().await {
            warn!(lease = %lease.id(), error = %e, "BEGIN failed, releasing connection");
            if let Err(rollback_err) = lease.execute("ROLLBACK", &[]).await {
                warn!(lease = %lease.id(), error = %rollback_err, "Best-effort ROLLBACK failed");
            }
            lease.release();
            return Err(e);
        }

        let transaction = Transaction {
            id: generate_transaction_id(),
            lease,
        };
        info!(
            transaction_id = %transaction.id,
            pool = %self.pool.identity(),
            "Transaction started"
        );
        Ok(transaction)
    }

    /// Open a server-side cursor over the query on a dedicated connection.
    pub async fn cursor_open(
        &self,
        template: &SqlTemplate,
        substitutions: Option<&Substitutions>,
    ) -> DbResult<Cursor> {
        let compiled = template::compile(template, substitutions)?;
        Cursor::open(&self.pool, &compiled).await
    }
}

#[async_trait]
impl Queryable for DbClient {
    async fn query(
        &mut self,
        template: &SqlTemplate,
        substitutions: Option<&Substitutions>,
    ) -> DbResult<QueryOutput> {
        DbClient::query(self, template, substitutions).await
    }
}

/// An open transaction pinned to one leased connection.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// A transaction dropped while open is rolled back in the background.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    lease: Lease,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.lease.in_transaction()
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn last_query(&self) -> Option<&QuerySnapshot> {
        self.lease.last_query()
    }

    /// How many times this transaction was reported idle.
    pub fn idle_warning_count(&self) -> usize {
        self.lease.idle_warning_count()
    }

    /// Run a statement on the transaction's connection.
    pub async fn query(
        &mut self,
        template: &SqlTemplate,
        substitutions: Option<&Substitutions>,
    ) -> DbResult<QueryOutput> {
        if !self.is_active() {
            return Err(DbError::transaction(format!(
                "Transaction {} is already finished",
                self.id
            )));
        }
        let compiled = template::compile(template, substitutions)?;
        self.lease.execute(&compiled.query, &compiled.values).await
    }

    /// COMMIT and release the connection. No-op once finished.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.finish("COMMIT").await
    }

    /// ROLLBACK and release the connection. No-op once finished.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, statement: &str) -> DbResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        let result = self.lease.finish(statement).await;
        match &result {
            Ok(()) => info!(transaction_id = %self.id, statement, "Transaction finished"),
            Err(e) => warn!(
                transaction_id = %self.id,
                statement,
                error = %e,
                "Transaction finish failed, connection released"
            ),
        }
        result
    }
}

#[async_trait]
impl Queryable for Transaction {
    async fn query(
        &mut self,
        template: &SqlTemplate,
        substitutions: Option<&Substitutions>,
    ) -> DbResult<QueryOutput> {
        Transaction::query(self, template, substitutions).await
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
