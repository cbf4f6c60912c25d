//! # Connections Module
//!
//! Implementations of the engine's collaborator contracts.

/// In-memory collaborators with failure injection.
pub mod memory;

/// PostgreSQL configuration store, sample sink and audit log.
#[cfg(feature = "connections")]
pub mod db_postgres;

/// Redis pub/sub and key reads as a value source.
#[cfg(feature = "connections")]
pub mod cache_redis;
