//! # meetq Persistence
//!
//! SQLite-backed [`JobStore`](meetq_queue::JobStore). Survives restarts and
//! is safe to share between processes pointing at the same database file.

pub mod queue;
pub mod sqlite;

pub use queue::SqliteJobStore;
pub use sqlite::{connect, migrate, SqliteConfig};
