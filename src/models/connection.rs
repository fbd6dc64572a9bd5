//! Connection-related data models.
//!
//! This module defines the identity used to select a pool.

use serde::{Deserialize, Serialize};

/// Default PostgreSQL port.
pub const DEFAULT_PORT: u16 = 5432;

/// Canonical identity of a database endpoint.
///
/// Pools are keyed by this identity, never by the configuration object that
/// produced it: two configurations with identical fields share one pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionIdentity {
    pub user: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ConnectionIdentity {
    pub fn new(
        user: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            database: database.into(),
        }
    }

    /// Canonical registry key.
    pub fn key(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

impl std::fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}
