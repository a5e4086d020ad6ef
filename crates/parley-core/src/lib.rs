//! Parley Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the Parley session broker. It includes:
//!
//! - Domain models (Account, Session, QueueEntry, outbound events)
//! - Collaborator traits for the account store, session persistence,
//!   status mirroring and push notifications
//! - Unified error handling with HTTP response mapping
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
