//! Database access layer.
//!
//! This module provides:
//! - Driver seams (`Connection`, `ConnectionSource`, `Driver`) and their `sqlx` implementation
//! - The identity-keyed pool registry with advisory lease accounting
//! - Leases, transactions and the idle-transaction watchdog
//! - Server-side cursor streaming
//! - Parameter binding and row decoding

pub mod client;
pub mod connection;
pub mod cursor;
pub mod lease;
pub(crate) mod params;
pub mod postgres;
pub mod registry;
pub mod types;

pub use client::{DbClient, Queryable, Transaction};
pub use connection::{Connection, ConnectionSource, Driver};
pub use cursor::{Cursor, CursorState};
pub use lease::{IdleWatchdog, Lease, LeaseState};
pub use postgres::{PgDriver, PgLeasedConnection, PgSource};
pub use registry::{Pool, PoolRegistry};
