//! Server-side cursor streaming.
//!
//! A cursor owns a dedicated lease for its whole life:
//!
//! 1. `Opening`: BEGIN, `SET LOCAL statement_timeout = 0`, DECLARE. Any failure
//!    rolls back and releases before the error is returned.
//! 2. `Open`: each [`Cursor::read`] issues one `FETCH FORWARD n`. An empty
//!    batch COMMITs, a failed fetch ROLLBACKs; both close the cursor and
//!    release the connection.
//! 3. `Closed`: further reads are caller errors.
//!
//! Exactly one of COMMIT or ROLLBACK is issued and the lease is released once.

use crate::db::lease::Lease;
use crate::db::registry::Pool;
use crate::error::{DbError, DbResult};
use crate::models::{Row, SqlTemplate};
use futures_util::Stream;
use futures_util::stream;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Opening,
    Open,
    Closed,
}

/// Incremental reader over a server-side cursor.
#[derive(Debug)]
pub struct Cursor {
    name: String,
    lease: Lease,
    state: CursorState,
}

impl Cursor {
    pub(crate) async fn open(pool: &Arc<Pool>, template: &SqlTemplate) -> DbResult<Self> {
        let lease = pool.acquire().await?;
        let mut cursor = Self {
            name: generate_cursor_name(),
            lease,
            state: CursorState::Opening,
        };

        if let Err(e) = cursor.declare(template).await {
            warn!(cursor = %cursor.name, error = %e, "Failed to open cursor");
            cursor.abort().await;
            return Err(e);
        }

        cursor.state = CursorState::Open;
        debug!(cursor = %cursor.name, lease = %cursor.lease.id(), "Cursor opened");
        Ok(cursor)
    }

    async fn declare(&mut self, template: &SqlTemplate) -> DbResult<()> {
        self.lease.begin_unwatched().await?;
        // Long streams must not be cut off by a server-side default timeout.
        // LOCAL: the override ends with the transaction, not the session.
        self.lease.execute("SET LOCAL statement_timeout = 0", &[]).await?;
        self.lease
            .declare_cursor(&self.name, &template.query, &template.values)
            .await
    }

    /// Roll back (best effort) and release after a failed open.
    async fn abort(&mut self) {
        self.state = CursorState::Closed;
        if !self.lease.is_released() {
            if let Err(e) = self.lease.execute("ROLLBACK", &[]).await {
                warn!(cursor = %self.name, error = %e, "Best-effort ROLLBACK failed");
            }
        }
        self.lease.release();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Whether neither COMMIT nor ROLLBACK has been issued yet.
    pub fn in_transaction(&self) -> bool {
        self.lease.in_transaction()
    }

    /// Fetch up to `batch_size` rows.
    ///
    /// An empty result means the cursor is exhausted: it has been committed,
    /// closed and its connection released.
    pub async fn read(&mut self, batch_size: u32) -> DbResult<Vec<Row>> {
        if self.state != CursorState::Open {
            return Err(DbError::cursor("Cursor is closed", &self.name));
        }
        if batch_size == 0 {
            return Err(DbError::invalid_input("batch_size must be greater than 0"));
        }

        match self.lease.fetch_cursor(&self.name, batch_size).await {
            Err(e) => {
                warn!(cursor = %self.name, error = %e, "Cursor read failed, rolling back");
                self.state = CursorState::Closed;
                if let Err(rollback_err) = self.lease.finish("ROLLBACK").await {
                    warn!(
                        cursor = %self.name,
                        error = %rollback_err,
                        "ROLLBACK after failed read failed"
                    );
                }
                Err(e)
            }
            Ok(rows) if rows.is_empty() => {
                debug!(cursor = %self.name, "Cursor exhausted");
                self.state = CursorState::Closed;
                self.lease.finish("COMMIT").await?;
                Ok(rows)
            }
            Ok(rows) => {
                debug!(cursor = %self.name, rows = rows.len(), "Cursor batch read");
                Ok(rows)
            }
        }
    }

    /// Stop reading early: COMMIT if still in the transaction and release.
    pub async fn end_connection(&mut self) -> DbResult<()> {
        self.state = CursorState::Closed;
        if self.lease.is_released() {
            return Ok(());
        }
        self.lease.finish("COMMIT").await
    }

    /// Consume the cursor as a stream of non-empty batches.
    ///
    /// The stream ends after the exhausting read or after the first error.
    pub fn into_stream(self, batch_size: u32) -> impl Stream<Item = DbResult<Vec<Row>>> + Send {
        stream::unfold(Some(self), move |cursor| async move {
            let mut cursor = cursor?;
            match cursor.read(batch_size).await {
                Ok(rows) if rows.is_empty() => None,
                Ok(rows) => Some((Ok(rows), Some(cursor))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Generate a unique server-side cursor name.
fn generate_cursor_name() -> String {
    format!("cursor_{}", uuid::Uuid::new_v4().simple())
}
