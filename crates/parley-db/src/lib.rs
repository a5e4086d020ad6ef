//! Parley Storage Layer
//!
//! This crate provides the account and session stores used by the engine:
//!
//! - Connection pool management and embedded migrations with sqlx
//! - PostgreSQL implementations of `AccountStore` and `SessionRepository`
//! - In-memory implementations for development mode and tests

pub mod memory;
pub mod pool;
pub mod repositories;

pub use memory::{InMemoryAccountStore, InMemorySessionRepository};
pub use pool::{create_pool, run_migrations};
pub use repositories::*;

// Re-export commonly used types
pub use parley_core::{AppError, AppResult};
pub use sqlx::PgPool;
