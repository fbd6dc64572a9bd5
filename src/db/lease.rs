//! Connection leases and the idle-transaction watchdog.
//!
//! A [`Lease`] is one physical connection checked out from a [`Pool`]. Only
//! the lease transitions its own [`LeaseState`]:
//!
//! ```text
//! Leased --begin--> InTransaction --finish--> Idle
//!   |                                          ^
//!   +----------------release-------------------+
//! ```
//!
//! `Idle` is terminal: the connection has gone back to the physical pool and
//! the pool's lease counter has been decremented exactly once.

use crate::db::connection::Connection;
use crate::db::registry::Pool;
use crate::error::{DbError, DbResult};
use crate::models::{QueryOutput, QueryParam, QuerySnapshot, Row};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of a lease.
#[derive(Debug)]
pub enum LeaseState {
    /// Returned to the pool.
    Idle,
    /// Checked out, no transaction open.
    Leased,
    /// Inside BEGIN ... COMMIT/ROLLBACK. The watchdog is absent for
    /// transactions that are expected to sit idle (cursor streams).
    InTransaction { watchdog: Option<IdleWatchdog> },
}

/// Timer that reports a transaction left idle for too long.
///
/// It only logs; the transaction is never aborted. Dropping the watchdog
/// cancels it.
pub struct IdleWatchdog {
    handle: JoinHandle<()>,
}

impl IdleWatchdog {
    fn arm(
        timeout: Duration,
        lease_id: String,
        pool: Arc<Pool>,
        last_query: Option<QuerySnapshot>,
        warnings: Arc<AtomicUsize>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warnings.fetch_add(1, Ordering::Relaxed);
            pool.record_idle_transaction();
            match last_query {
                Some(snapshot) => warn!(
                    lease = %lease_id,
                    pool = %pool.identity(),
                    idle_secs = timeout.as_secs(),
                    last_query = %snapshot.sql,
                    params = ?snapshot.params,
                    issued_at = %snapshot.issued_at,
                    "Transaction idle - was it committed or rolled back?"
                ),
                None => warn!(
                    lease = %lease_id,
                    pool = %pool.identity(),
                    idle_secs = timeout.as_secs(),
                    "Transaction idle - was it committed or rolled back?"
                ),
            }
        });
        Self { handle }
    }
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl std::fmt::Debug for IdleWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleWatchdog")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

/// One checked-out physical connection.
pub struct Lease {
    id: String,
    pool: Arc<Pool>,
    conn: Option<Box<dyn Connection>>,
    state: LeaseState,
    last_query: Option<QuerySnapshot>,
    idle_warnings: Arc<AtomicUsize>,
}

impl Lease {
    pub(crate) fn new(pool: Arc<Pool>, conn: Box<dyn Connection>) -> Self {
        Self {
            id: generate_lease_id(),
            pool,
            conn: Some(conn),
            state: LeaseState::Leased,
            last_query: None,
            idle_warnings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn state(&self) -> &LeaseState {
        &self.state
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.state, LeaseState::InTransaction { .. })
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, LeaseState::Idle)
    }

    /// Most recent statement issued on this lease.
    pub fn last_query(&self) -> Option<&QuerySnapshot> {
        self.last_query.as_ref()
    }

    /// How many times the idle watchdog fired on this lease.
    pub fn idle_warning_count(&self) -> usize {
        self.idle_warnings.load(Ordering::Relaxed)
    }

    /// Execute a statement on the leased connection.
    ///
    /// In a watched transaction every statement cancels the idle watchdog and
    /// arms a fresh one quoting this statement.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryOutput> {
        self.record_statement(sql, params);
        let conn = self.connection()?;
        debug!(sql = %sql, params = params.len(), "Executing statement");
        conn.execute(sql, params).await
    }

    pub(crate) async fn declare_cursor(
        &mut self,
        name: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<()> {
        self.record_statement(sql, params);
        let conn = self.connection()?;
        debug!(cursor = %name, sql = %sql, "Declaring cursor");
        conn.open_cursor(name, sql, params).await
    }

    pub(crate) async fn fetch_cursor(&mut self, name: &str, count: u32) -> DbResult<Vec<Row>> {
        self.record_statement(&format!("FETCH FORWARD {count} FROM {name}"), &[]);
        let conn = self.connection()?;
        conn.fetch(name, count).await
    }

    /// Issue BEGIN and arm the idle watchdog.
    pub(crate) async fn begin(&mut self) -> DbResult<()> {
        self.start_transaction(true).await
    }

    /// Issue BEGIN without a watchdog.
    pub(crate) async fn begin_unwatched(&mut self) -> DbResult<()> {
        self.start_transaction(false).await
    }

    async fn start_transaction(&mut self, watched: bool) -> DbResult<()> {
        if !matches!(self.state, LeaseState::Leased) {
            return Err(DbError::transaction(format!(
                "Cannot BEGIN on lease {} in state {:?}",
                self.id, self.state
            )));
        }
        self.execute("BEGIN", &[]).await?;
        let watchdog = watched.then(|| self.arm_watchdog());
        self.state = LeaseState::InTransaction { watchdog };
        Ok(())
    }

    /// End the transaction with `statement` (COMMIT or ROLLBACK) and release.
    ///
    /// The lease is released even when the statement fails. Once released,
    /// further calls are no-ops.
    pub(crate) async fn finish(&mut self, statement: &str) -> DbResult<()> {
        if !self.in_transaction() {
            self.release();
            return Ok(());
        }

        // Leaving InTransaction drops (and cancels) the watchdog.
        self.state = LeaseState::Leased;
        let result = self.execute(statement, &[]).await.map(|_| ());
        self.release();
        result
    }

    /// Return the connection to the pool. Idempotent.
    pub(crate) fn release(&mut self) {
        if self.is_released() {
            return;
        }
        self.state = LeaseState::Idle;
        drop(self.conn.take());
        self.pool.release_lease();
        debug!(
            lease = %self.id,
            pool = %self.pool.identity(),
            active = self.pool.active_leases(),
            "Connection returned to pool"
        );
    }

    fn connection(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        let id = &self.id;
        self.conn.as_mut().ok_or_else(|| {
            DbError::transaction(format!("Lease {id} was already returned to the pool"))
        })
    }

    fn record_statement(&mut self, sql: &str, params: &[QueryParam]) {
        self.last_query = Some(QuerySnapshot::new(sql, params));
        if matches!(self.state, LeaseState::InTransaction { watchdog: Some(_) }) {
            // Assigning drops the previous watchdog, which aborts it.
            let watchdog = Some(self.arm_watchdog());
            self.state = LeaseState::InTransaction { watchdog };
        }
    }

    fn arm_watchdog(&self) -> IdleWatchdog {
        IdleWatchdog::arm(
            self.pool.options().idle_transaction_timeout_or_default(),
            self.id.clone(),
            Arc::clone(&self.pool),
            self.last_query.clone(),
            Arc::clone(&self.idle_warnings),
        )
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        if !self.in_transaction() {
            self.release();
            return;
        }

        warn!(
            lease = %self.id,
            pool = %self.pool.identity(),
            "Lease dropped inside a transaction - rolling back; commit or roll back explicitly"
        );

        self.state = LeaseState::Idle;
        let conn = self.conn.take();
        let pool = Arc::clone(&self.pool);
        let lease_id = self.id.clone();

        match (conn, tokio::runtime::Handle::try_current()) {
            (Some(mut conn), Ok(handle)) => {
                handle.spawn(async move {
                    if let Err(e) = conn.execute("ROLLBACK", &[]).await {
                        warn!(lease = %lease_id, error = %e, "Rollback of dropped lease failed");
                    }
                    drop(conn);
                    pool.release_lease();
                });
            }
            (conn, _) => {
                // No runtime to roll back on: the driver discards the session.
                drop(conn);
                pool.release_lease();
            }
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("pool", self.pool.identity())
            .field("state", &self.state)
            .field("last_query", &self.last_query)
            .finish_non_exhaustive()
    }
}

/// Generate a unique lease ID.
fn generate_lease_id() -> String {
    format!("lease_{}", uuid::Uuid::new_v4().simple())
}
