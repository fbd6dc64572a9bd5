//! pgpool-lease Library
//!
//! A pooled, transaction-aware query layer for PostgreSQL:
//! - round-trip queries and pinned transactions over identity-keyed pools
//! - server-side cursor streaming
//! - `{{ macro }}` template expansion and positional query building
//! - durable LISTEN/NOTIFY subscriptions with reconnect backoff

pub mod config;
pub mod db;
pub mod error;
pub mod listen;
pub mod models;
pub mod template;

pub use config::{Config, PoolConfig};
pub use db::{Cursor, DbClient, PoolRegistry, Queryable, Transaction};
pub use error::{DbError, DbResult};
pub use listen::{Listener, Notification, listen_notify};
pub use models::{QueryOutput, QueryParam, SqlTemplate};
pub use template::{Substitutions, compile, positional};
