//! Identity-keyed pool registry.
//!
//! # Design Decisions
//!
//! - **Injectable registry**: a `PoolRegistry` is an ordinary value built from a
//!   [`Driver`]; independent registries never share pools
//! - **Keyed by identity**: pools are looked up by `ConnectionIdentity::key()`,
//!   so equal configurations share one pool even when built separately
//! - **`OnceCell` per key**: single-flight pool creation, no lock held while the
//!   driver opens the pool
//! - **`AtomicUsize` lease counter**: incremented once per successful lease,
//!   decremented once per release, saturating at 0
//!
//! The lease counter is advisory. Reaching `max_connections` only logs a
//! warning; the physical pool enforces the hard limit.

use crate::config::{PoolConfig, PoolOptions};
use crate::db::connection::{ConnectionSource, Driver};
use crate::db::lease::Lease;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

/// A physical pool plus lease accounting for one connection identity.
pub struct Pool {
    identity: ConnectionIdentity,
    options: PoolOptions,
    source: Arc<dyn ConnectionSource>,
    active_leases: AtomicUsize,
    capacity_warnings: AtomicUsize,
    idle_transaction_warnings: AtomicUsize,
}

impl Pool {
    pub fn new(
        identity: ConnectionIdentity,
        options: PoolOptions,
        source: Arc<dyn ConnectionSource>,
    ) -> Self {
        Self {
            identity,
            options,
            source,
            active_leases: AtomicUsize::new(0),
            capacity_warnings: AtomicUsize::new(0),
            idle_transaction_warnings: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Check out one physical connection.
    ///
    /// Logs (and counts) a capacity warning when the leases already out reach
    /// `max_connections - 1`; acquisition proceeds regardless. On failure the
    /// counter is rolled back and a connection error is returned without retry.
    pub async fn acquire(self: &Arc<Self>) -> DbResult<Lease> {
        let previous = self.active_leases.fetch_add(1, Ordering::AcqRel);
        let max = self.options.max_connections_or_default() as usize;
        if previous >= max.saturating_sub(1) {
            self.capacity_warnings.fetch_add(1, Ordering::Relaxed);
            warn!(
                pool = %self.identity,
                active = previous + 1,
                max_connections = max,
                "Connection pool at capacity - leases may wait on the physical pool"
            );
        }

        match self.source.acquire().await {
            Ok(conn) => {
                let lease = Lease::new(Arc::clone(self), conn);
                debug!(
                    pool = %self.identity,
                    lease = %lease.id(),
                    active = previous + 1,
                    "Connection leased"
                );
                Ok(lease)
            }
            Err(e) => {
                self.release_lease();
                warn!(pool = %self.identity, error = %e, "Failed to acquire connection");
                Err(match e {
                    DbError::Connection { .. } => e,
                    other => DbError::connection(
                        other.to_string(),
                        "Check that the database server is reachable and accepting connections",
                    ),
                })
            }
        }
    }

    /// Decrement the lease counter. Saturates at 0 to absorb extra release calls.
    pub(crate) fn release_lease(&self) {
        let result = self
            .active_leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });

        if let Ok(0) = result {
            warn!(
                pool = %self.identity,
                "Active lease count underflow detected - extra release call"
            );
        }
    }

    pub(crate) fn record_idle_transaction(&self) {
        self.idle_transaction_warnings.fetch_add(1, Ordering::Relaxed);
    }

    /// Leases currently checked out.
    pub fn active_leases(&self) -> usize {
        self.active_leases.load(Ordering::Acquire)
    }

    /// Number of capacity warnings logged so far.
    pub fn capacity_warnings(&self) -> usize {
        self.capacity_warnings.load(Ordering::Relaxed)
    }

    /// Number of idle-transaction warnings logged by leases of this pool.
    pub fn idle_transaction_warnings(&self) -> usize {
        self.idle_transaction_warnings.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("identity", &self.identity)
            .field("options", &self.options)
            .field("active_leases", &self.active_leases.load(Ordering::Relaxed))
            .field(
                "capacity_warnings",
                &self.capacity_warnings.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Maps connection identities to pools, creating them lazily on first use.
pub struct PoolRegistry {
    driver: Arc<dyn Driver>,
    pools: TokioRwLock<HashMap<String, Arc<OnceCell<Arc<Pool>>>>>,
}

impl PoolRegistry {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            pools: TokioRwLock::new(HashMap::new()),
        }
    }

    /// Registry backed by the `sqlx` Postgres driver.
    pub fn postgres() -> Self {
        Self::new(Arc::new(crate::db::postgres::PgDriver))
    }

    /// Get the pool for a configuration's identity, creating it on first use.
    ///
    /// The first configuration seen for an identity decides the pool options.
    pub async fn pool_for(&self, config: &PoolConfig) -> DbResult<Arc<Pool>> {
        config.options.validate()?;
        let key = config.identity.key();

        // Fast path: cell already exists
        let cell = {
            let pools = self.pools.read().await;
            pools.get(&key).cloned()
        };

        let cell = match cell {
            Some(cell) => cell,
            None => {
                let mut pools = self.pools.write().await;
                Arc::clone(
                    pools
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        let pool = cell
            .get_or_try_init(|| async {
                let source = self.driver.open(config).await?;
                info!(
                    pool = %config.identity,
                    max_connections = config.options.max_connections_or_default(),
                    "Created connection pool"
                );
                Ok::<_, DbError>(Arc::new(Pool::new(
                    config.identity.clone(),
                    config.options.clone(),
                    source,
                )))
            })
            .await?;

        Ok(Arc::clone(pool))
    }

    /// Look up an existing pool without creating one.
    pub async fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<Pool>> {
        let pools = self.pools.read().await;
        pools
            .get(&identity.key())
            .and_then(|cell| cell.get())
            .cloned()
    }

    /// Number of pools created so far.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.initialized()).count()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry").finish_non_exhaustive()
    }
}
