//! Repository implementations
//!
//! Concrete implementations of the storage traits defined in parley-core,
//! using sqlx for PostgreSQL access.

pub mod account_repo;
pub mod session_repo;

pub use account_repo::PgAccountStore;
pub use session_repo::PgSessionRepository;
