//! Data models for the pooled query layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionIdentity, DEFAULT_PORT};
pub use query::{QueryOutput, QueryParam, QuerySnapshot, Row, SqlTemplate};
