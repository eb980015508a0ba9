//! Infrastructure layer for cairn.
//!
//! Implementations of the repository traits defined in `cairn-core`: a SQLite
//! backend for durable runs, an in-memory backend for tests and ephemeral
//! runs, and the configuration loader.

pub mod config;
pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
